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

//! Prompt templates and their versions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::run_store::{json_text, parse_json, parse_uuid};
use crate::schema::{decode_timestamp, encode_timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub project_id: Uuid,
    pub slug: String,
    pub name: Option<String>,
    pub mode: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One published or draft revision of a template.
///
/// `content` is either a plain string or an array of chat messages; `extra`
/// holds model parameters (`model`, `temperature`, `max_tokens`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub id: i64,
    pub template_id: i64,
    pub slug: String,
    pub content: Value,
    pub extra: Option<Value>,
    pub test_values: Option<Value>,
    pub is_draft: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Input for a new template version
#[derive(Debug, Clone, Default)]
pub struct NewTemplateVersion {
    pub content: Value,
    pub extra: Option<Value>,
    pub test_values: Option<Value>,
    pub is_draft: bool,
}

#[derive(Clone)]
pub struct TemplateStore {
    pool: SqlitePool,
}

impl TemplateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_template(
        &self,
        project_id: Uuid,
        slug: &str,
        mode: Option<&str>,
    ) -> Result<Template> {
        let created_at = Utc::now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO template (project_id, slug, name, mode, created_at)
             VALUES (?1, ?2, ?2, ?3, ?4) RETURNING id",
        )
        .bind(project_id.to_string())
        .bind(slug)
        .bind(mode)
        .bind(encode_timestamp(&created_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(Template {
            id,
            project_id,
            slug: slug.to_string(),
            name: Some(slug.to_string()),
            mode: mode.map(str::to_string),
            created_at: decode_timestamp(&encode_timestamp(&created_at))?,
        })
    }

    /// Append a version to a template. Version numbers count up from 1.
    pub async fn add_version(
        &self,
        template_id: i64,
        version: &NewTemplateVersion,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM template_version WHERE template_id = ?1",
        )
        .bind(template_id)
        .fetch_one(&mut *tx)
        .await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO template_version
                (template_id, content, extra, test_values, is_draft, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING id",
        )
        .bind(template_id)
        .bind(serde_json::to_string(&version.content)?)
        .bind(json_text(version.extra.as_ref())?)
        .bind(json_text(version.test_values.as_ref())?)
        .bind(version.is_draft)
        .bind(next)
        .bind(encode_timestamp(&created_at))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Newest non-draft version of the template `slug` in `project_id`.
    pub async fn latest_version(
        &self,
        project_id: Uuid,
        slug: &str,
    ) -> Result<Option<TemplateVersion>> {
        let row = sqlx::query(
            "SELECT tv.id, tv.template_id, t.slug, tv.content, tv.extra, tv.test_values,
                    tv.is_draft, tv.version, tv.created_at
             FROM template t
             INNER JOIN template_version tv ON t.id = tv.template_id
             WHERE t.project_id = ?1 AND t.slug = ?2 AND tv.is_draft = 0
             ORDER BY tv.created_at DESC, tv.id DESC
             LIMIT 1",
        )
        .bind(project_id.to_string())
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    pub async fn project_of_version(&self, version_id: i64) -> Result<Option<Uuid>> {
        let project: Option<String> = sqlx::query_scalar(
            "SELECT t.project_id FROM template_version tv
             INNER JOIN template t ON t.id = tv.template_id
             WHERE tv.id = ?1",
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;
        project.map(|p| parse_uuid(&p)).transpose()
    }
}

fn version_from_row(row: &SqliteRow) -> Result<TemplateVersion> {
    Ok(TemplateVersion {
        id: row.try_get("id")?,
        template_id: row.try_get("template_id")?,
        slug: row.try_get("slug")?,
        content: parse_json(row.try_get("content")?)?.unwrap_or(Value::Null),
        extra: parse_json(row.try_get("extra")?)?,
        test_values: parse_json(row.try_get("test_values")?)?,
        is_draft: row.try_get("is_draft")?,
        version: row.try_get("version")?,
        created_at: decode_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{project, ts, TestDb};
    use serde_json::json;

    fn version(content: &str, is_draft: bool) -> NewTemplateVersion {
        NewTemplateVersion {
            content: json!([{"role": "user", "content": content}]),
            extra: Some(json!({"model": "gpt-4", "max_tokens": 100})),
            test_values: None,
            is_draft,
        }
    }

    #[tokio::test]
    async fn test_latest_skips_drafts() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let templates = db.storage.templates();
        let template = templates.create_template(project_id, "greeting", Some("openai")).await.unwrap();

        templates.add_version(template.id, &version("v1", false), ts(0)).await.unwrap();
        let published = templates.add_version(template.id, &version("v2", false), ts(10)).await.unwrap();
        templates.add_version(template.id, &version("v3 draft", true), ts(20)).await.unwrap();

        let latest = templates.latest_version(project_id, "greeting").await.unwrap().unwrap();
        assert_eq!(latest.id, published);
        assert_eq!(latest.version, 2);
        assert_eq!(latest.extra, Some(json!({"model": "gpt-4", "max_tokens": 100})));
        assert_eq!(
            templates.project_of_version(published).await.unwrap(),
            Some(project_id)
        );
    }

    #[tokio::test]
    async fn test_latest_is_scoped_to_project() {
        let db = TestDb::new().await;
        let owner = project(&db.storage).await;
        let other = project(&db.storage).await;
        let templates = db.storage.templates();
        let template = templates.create_template(owner, "greeting", None).await.unwrap();
        templates.add_version(template.id, &version("hi", false), ts(0)).await.unwrap();

        assert!(templates.latest_version(other, "greeting").await.unwrap().is_none());
        assert!(templates.latest_version(owner, "missing").await.unwrap().is_none());
    }
}
