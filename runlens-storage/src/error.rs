// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),
}

impl From<runlens_core::CoreError> for StorageError {
    fn from(e: runlens_core::CoreError) -> Self {
        StorageError::InvalidRow(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
