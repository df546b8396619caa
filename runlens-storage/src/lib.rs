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

//! Runlens Storage Layer
//!
//! SQLite-backed relational store for runs, templates, radars and model
//! mappings.
//!
//! ## Architecture
//!
//! - **Run Store**: run records, logs, feedback, usage projections
//! - **Template Store**: prompt templates and their published versions
//! - **Radar Store**: saved checks and their per-run results
//! - **Mapping Store**: database-managed model pricing
//!
//! ## Usage
//!
//! ```rust,ignore
//! use runlens_storage::Storage;
//!
//! let storage = Storage::connect("sqlite://runlens.db").await?;
//! let run = storage.runs().get_run(project_id, run_id).await?;
//! ```

pub mod error;
pub mod filters;
pub mod mapping_store;
pub mod project_store;
pub mod radar_store;
pub mod run_store;
pub mod schema;
pub mod template_store;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub use error::{Result, StorageError};
pub use filters::{is_sql_check, is_sql_logic, push_logic_sql};
pub use mapping_store::MappingStore;
pub use project_store::{Project, ProjectStore};
pub use radar_store::{Radar, RadarResult, RadarStore};
pub use run_store::{CostCursor, DailyCount, RunCompletion, RunStore, UsageRecord};
pub use schema::{decode_timestamp, encode_timestamp, run_migrations};
pub use template_store::{NewTemplateVersion, Template, TemplateStore, TemplateVersion};

/// Open a connection pool for `database_url` without running migrations.
///
/// In-memory databases are limited to a single connection since every
/// connection would otherwise see its own empty database.
pub async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| StorageError::InvalidUrl(format!("{}: {}", database_url, e)))?
        .create_if_missing(true)
        .foreign_keys(true);

    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let (options, max_connections) = if in_memory {
        (options, 1)
    } else {
        (options.journal_mode(SqliteJournalMode::Wal), 8)
    };

    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        // Closing the only connection would discard the database
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// Handle to every store, sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open the database and bring its schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = open_pool(database_url).await?;
        run_migrations(&pool).await?;
        info!("Storage ready at {}", database_url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round trip to check the database answers.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn runs(&self) -> RunStore {
        RunStore::new(self.pool.clone())
    }

    pub fn projects(&self) -> ProjectStore {
        ProjectStore::new(self.pool.clone())
    }

    pub fn templates(&self) -> TemplateStore {
        TemplateStore::new(self.pool.clone())
    }

    pub fn radars(&self) -> RadarStore {
        RadarStore::new(self.pool.clone())
    }

    pub fn mappings(&self) -> MappingStore {
        MappingStore::new(self.pool.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    pub struct TestDb {
        pub storage: Storage,
    }

    impl TestDb {
        pub async fn new() -> Self {
            Self {
                storage: Storage::connect("sqlite::memory:").await.unwrap(),
            }
        }
    }

    /// 2024-01-01T00:00:00Z plus `secs` seconds
    pub fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    pub async fn project(storage: &Storage) -> Uuid {
        storage.projects().create("test").await.unwrap().id
    }
}
