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

//! Versioned schema migrations
//!
//! Applied versions are tracked in `schema_version`; only pending steps run.
//! Timestamps are stored as fixed-width RFC 3339 UTC text so that text order
//! equals time order and `substr(created_at, 1, 10)` is the UTC day.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{Result, StorageError};

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS project (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS run (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES project(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            ended_at TEXT,
            type TEXT NOT NULL,
            name TEXT,
            parent_run_id TEXT REFERENCES run(id) ON DELETE SET NULL,
            sibling_run_id TEXT,
            input TEXT,
            output TEXT,
            error TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            params TEXT,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            cost REAL,
            status TEXT,
            feedback TEXT,
            metadata TEXT,
            template_version_id INTEGER,
            runtime TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_run_project_created ON run(project_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_run_parent ON run(parent_run_id);
        CREATE INDEX IF NOT EXISTS idx_run_missing_cost ON run(created_at, id) WHERE cost IS NULL;

        CREATE TABLE IF NOT EXISTS log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            project_id TEXT NOT NULL REFERENCES project(id) ON DELETE CASCADE,
            level TEXT NOT NULL,
            message TEXT,
            extra TEXT,
            created_at TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        r#"
        CREATE TABLE IF NOT EXISTS template (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL REFERENCES project(id) ON DELETE CASCADE,
            slug TEXT NOT NULL,
            name TEXT,
            mode TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(project_id, slug)
        );

        CREATE TABLE IF NOT EXISTS template_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            template_id INTEGER NOT NULL REFERENCES template(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            extra TEXT,
            test_values TEXT,
            is_draft INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_template_version_template
            ON template_version(template_id, created_at);
        "#,
    ),
    (
        3,
        r#"
        CREATE TABLE IF NOT EXISTS radar (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES project(id) ON DELETE CASCADE,
            description TEXT,
            view TEXT NOT NULL DEFAULT '[]',
            checks TEXT NOT NULL DEFAULT '[]',
            alerts TEXT,
            negative INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS radar_result (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            radar_id TEXT NOT NULL REFERENCES radar(id) ON DELETE CASCADE,
            run_id TEXT NOT NULL REFERENCES run(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            results TEXT NOT NULL,
            passed INTEGER NOT NULL,
            UNIQUE(radar_id, run_id)
        );

        CREATE INDEX IF NOT EXISTS idx_radar_result_run ON radar_result(run_id);
        "#,
    ),
    (
        4,
        r#"
        CREATE TABLE IF NOT EXISTS model_mapping (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            pattern TEXT NOT NULL,
            unit TEXT NOT NULL DEFAULT 'TOKENS',
            input_cost REAL NOT NULL,
            output_cost REAL NOT NULL,
            project_id TEXT REFERENCES project(id) ON DELETE CASCADE,
            start_date TEXT,
            provider TEXT
        );
        "#,
    ),
    (
        5,
        r#"
        ALTER TABLE run ADD COLUMN cached_prompt_tokens INTEGER;
        ALTER TABLE model_mapping
            ADD COLUMN input_caching_cost_reduction REAL NOT NULL DEFAULT 0;
        "#,
    ),
];

/// Apply every migration newer than the recorded schema version.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);

    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let mut tx = pool.begin().await?;
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)")
            .bind(*version)
            .bind(encode_timestamp(&Utc::now()))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("Applied schema migration {}", version);
    }

    Ok(())
}

/// Fixed-width RFC 3339 encoding used for every stored timestamp.
pub fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidRow(format!("invalid timestamp '{}': {}", raw, e)))
}
