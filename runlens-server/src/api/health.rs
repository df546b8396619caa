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

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::{debug, warn};

use crate::api::{ApiError, AppState};

/// Health check response structure
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub storage: StorageHealth,
    pub evaluators: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StorageHealth {
    pub reachable: bool,
    pub model_mappings: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    debug!("Health check requested");

    let storage_reachable = match state.storage.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Storage health check failed: {}", e);
            false
        }
    };

    let health = HealthResponse {
        status: if storage_reachable {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        storage: StorageHealth {
            reachable: storage_reachable,
            model_mappings: state.pricing.mapping_count(),
        },
        evaluators: state.checks.runner().registry().ids(),
    };

    let status_code = if storage_reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((status_code, Json(health)))
}
