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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::run_store::parse_uuid;
use crate::schema::{decode_timestamp, encode_timestamp};

/// Tenant boundary for runs, templates and radars
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ProjectStore {
    pool: SqlitePool,
}

impl ProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, name: &str) -> Result<Project> {
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.insert(&project).await?;
        Ok(project)
    }

    pub async fn insert(&self, project: &Project) -> Result<()> {
        sqlx::query("INSERT INTO project (id, name, created_at) VALUES (?1, ?2, ?3)")
            .bind(project.id.to_string())
            .bind(&project.name)
            .bind(encode_timestamp(&project.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, name, created_at FROM project WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Project {
                id: parse_uuid(&row.try_get::<String, _>("id")?)?,
                name: row.try_get("name")?,
                created_at: decode_timestamp(&row.try_get::<String, _>("created_at")?)?,
            })
        })
        .transpose()
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Delete a project and, through cascades, everything it owns.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM project WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
