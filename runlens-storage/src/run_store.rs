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

//! Run Store
//!
//! Persistence for run records. Runs are created by ingestion, updated as they
//! complete, and only ever removed through project deletion (cascade).
//! JSON-typed fields (input, output, error, params, feedback, metadata, tags)
//! are stored as JSON text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use runlens_core::{Run, RunStatus, RunType};

use crate::error::{Result, StorageError};
use crate::schema::{decode_timestamp, encode_timestamp};

pub(crate) const RUN_COLUMNS: &str = "run.id, run.project_id, run.created_at, run.ended_at, run.type, \
     run.name, run.parent_run_id, run.sibling_run_id, run.input, run.output, run.error, run.tags, \
     run.params, run.prompt_tokens, run.completion_tokens, run.cost, run.status, run.feedback, \
     run.metadata, run.template_version_id, run.runtime, run.cached_prompt_tokens";

/// Values written when a run completes successfully
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub cached_prompt_tokens: Option<i64>,
    pub cost: Option<f64>,
}

/// Position of the cost backfill scan: the last `(created_at, id)` seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// `{date, count}` row of the daily usage series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

/// Minimal per-run projection used by the usage aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub created_at: DateTime<Utc>,
    pub run_type: RunType,
    pub name: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub cost: Option<f64>,
    /// `None` when no check result exists for the run
    pub check_passed: Option<bool>,
}

/// Run persistence backed by SQLite
#[derive(Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new run. The run must satisfy [`Run::validate`].
    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        run.validate()?;
        sqlx::query(
            "INSERT INTO run (
                id, project_id, created_at, ended_at, type, name, parent_run_id, sibling_run_id,
                input, output, error, tags, params, prompt_tokens, completion_tokens, cost,
                status, feedback, metadata, template_version_id, runtime, cached_prompt_tokens
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22
            )",
        )
        .bind(run.id.to_string())
        .bind(run.project_id.to_string())
        .bind(encode_timestamp(&run.created_at))
        .bind(run.ended_at.as_ref().map(encode_timestamp))
        .bind(run.run_type.as_str())
        .bind(run.name.as_deref())
        .bind(run.parent_run_id.map(|id| id.to_string()))
        .bind(run.sibling_run_id.map(|id| id.to_string()))
        .bind(json_text(run.input.as_ref())?)
        .bind(json_text(run.output.as_ref())?)
        .bind(json_text(run.error.as_ref())?)
        .bind(serde_json::to_string(&run.tags)?)
        .bind(json_text(run.params.as_ref())?)
        .bind(run.prompt_tokens)
        .bind(run.completion_tokens)
        .bind(run.cost)
        .bind(run.status.map(|s| s.as_str()))
        .bind(json_text(run.feedback.as_ref())?)
        .bind(json_text(run.metadata.as_ref())?)
        .bind(run.template_version_id)
        .bind(run.runtime.as_deref())
        .bind(run.cached_prompt_tokens)
        .execute(&self.pool)
        .await?;
        debug!("Inserted run {} ({})", run.id, run.run_type);
        Ok(())
    }

    /// Create or refresh a thread marker run.
    pub async fn upsert_thread(&self, run: &Run) -> Result<()> {
        if run.run_type != RunType::Thread {
            return Err(StorageError::InvalidRow(format!(
                "run {} is not a thread",
                run.id
            )));
        }
        run.validate()?;
        sqlx::query(
            "INSERT INTO run (id, project_id, created_at, type, tags, input)
             VALUES (?1, ?2, ?3, 'thread', ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                tags = excluded.tags,
                input = excluded.input
             WHERE run.project_id = excluded.project_id",
        )
        .bind(run.id.to_string())
        .bind(run.project_id.to_string())
        .bind(encode_timestamp(&run.created_at))
        .bind(serde_json::to_string(&run.tags)?)
        .bind(json_text(run.input.as_ref())?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, project_id: Uuid, id: Uuid) -> Result<Option<Run>> {
        let sql = format!(
            "SELECT {} FROM run WHERE run.id = ?1 AND run.project_id = ?2",
            RUN_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(project_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Project of a run, looked up by id alone.
    pub async fn project_of(&self, id: Uuid) -> Result<Option<Uuid>> {
        let project: Option<String> =
            sqlx::query_scalar("SELECT project_id FROM run WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        project.map(|p| parse_uuid(&p)).transpose()
    }

    pub async fn run_exists(&self, project_id: Uuid, id: Uuid) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM run WHERE id = ?1 AND project_id = ?2")
                .bind(id.to_string())
                .bind(project_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Runs of `project_id` whose parent is one of `parent_ids`, oldest first.
    pub async fn children_of(&self, project_id: Uuid, parent_ids: &[Uuid]) -> Result<Vec<Run>> {
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM run WHERE run.project_id = ",
            RUN_COLUMNS
        ));
        qb.push_bind(project_id.to_string());
        qb.push(" AND run.parent_run_id IN (");
        let mut sep = qb.separated(", ");
        for id in parent_ids {
            sep.push_bind(id.to_string());
        }
        qb.push(") ORDER BY run.created_at ASC, run.id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Most recent direct child of a run.
    pub async fn latest_child(&self, parent_id: Uuid) -> Result<Option<Run>> {
        let sql = format!(
            "SELECT {} FROM run WHERE run.parent_run_id = ?1
             ORDER BY run.created_at DESC, run.id DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(parent_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Mark a run successful. Returns `false` if the run does not exist.
    ///
    /// An end time earlier than the run's start is stored as the start.
    pub async fn complete_run(&self, id: Uuid, completion: &RunCompletion) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE run SET
                ended_at = MAX(COALESCE(?2, ended_at), created_at),
                output = ?3,
                status = 'success',
                prompt_tokens = COALESCE(?4, prompt_tokens),
                completion_tokens = COALESCE(?5, completion_tokens),
                cost = COALESCE(?6, cost),
                cached_prompt_tokens = COALESCE(?7, cached_prompt_tokens)
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(completion.ended_at.as_ref().map(encode_timestamp))
        .bind(json_text(completion.output.as_ref())?)
        .bind(completion.prompt_tokens)
        .bind(completion.completion_tokens)
        .bind(completion.cost)
        .bind(completion.cached_prompt_tokens)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fail_run(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        error: Option<&Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE run SET ended_at = MAX(?2, created_at), status = 'error', error = ?3
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(encode_timestamp(&ended_at))
        .bind(json_text(error)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Shallow-merge `patch` into the stored feedback object.
    pub async fn merge_feedback(&self, id: Uuid, patch: &Value) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let current: Option<Option<String>> =
            sqlx::query_scalar("SELECT feedback FROM run WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Ok(false);
        };

        let mut merged = match parse_json(current)? {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        if let Value::Object(patch) = patch {
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
        }

        sqlx::query("UPDATE run SET feedback = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(serde_json::to_string(&Value::Object(merged))?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Replace a run's message arrays (chat reconciliation).
    pub async fn update_messages(
        &self,
        id: Uuid,
        input: Option<&Value>,
        output: Option<&Value>,
        ended_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE run SET
                input = COALESCE(?2, input),
                output = COALESCE(?3, output),
                ended_at = MAX(?4, created_at)
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(json_text(input)?)
        .bind(json_text(output)?)
        .bind(encode_timestamp(&ended_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_log(
        &self,
        project_id: Uuid,
        run_id: Uuid,
        level: &str,
        message: Option<&str>,
        extra: Option<&Value>,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO log (run_id, project_id, level, message, extra, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(run_id.to_string())
        .bind(project_id.to_string())
        .bind(level)
        .bind(message)
        .bind(json_text(extra)?)
        .bind(encode_timestamp(&created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Next page of named LLM runs without a cost, strictly after `after`.
    pub async fn runs_missing_cost(
        &self,
        after: Option<&CostCursor>,
        limit: i64,
    ) -> Result<Vec<Run>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM run WHERE run.cost IS NULL AND run.type = 'llm' AND run.name IS NOT NULL",
            RUN_COLUMNS
        ));
        if let Some(cursor) = after {
            let created = encode_timestamp(&cursor.created_at);
            qb.push(" AND (run.created_at > ");
            qb.push_bind(created.clone());
            qb.push(" OR (run.created_at = ");
            qb.push_bind(created);
            qb.push(" AND run.id > ");
            qb.push_bind(cursor.id.to_string());
            qb.push("))");
        }
        qb.push(" ORDER BY run.created_at ASC, run.id ASC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Write a cost only if none is stored yet. Returns whether a row changed.
    pub async fn set_cost_if_null(&self, id: Uuid, cost: f64) -> Result<bool> {
        let result = sqlx::query("UPDATE run SET cost = ?2 WHERE id = ?1 AND cost IS NULL")
            .bind(id.to_string())
            .bind(cost)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Run counts per UTC day since `since`, newest day first. Days without
    /// runs are absent.
    pub async fn daily_counts(
        &self,
        project_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<Vec<DailyCount>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT substr(created_at, 1, 10) AS date, COUNT(*) AS count FROM run WHERE created_at > ",
        );
        qb.push_bind(encode_timestamp(&since));
        if let Some(project_id) = project_id {
            qb.push(" AND project_id = ");
            qb.push_bind(project_id.to_string());
        }
        qb.push(" GROUP BY date ORDER BY date DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(DailyCount {
                    date: row.try_get("date")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    /// Per-run usage projection for a project since `since`.
    ///
    /// `check_passed` folds every radar result of the run (all must pass),
    /// restricted to `radar_id` when given.
    pub async fn usage_records(
        &self,
        project_id: Uuid,
        since: DateTime<Utc>,
        radar_id: Option<Uuid>,
    ) -> Result<Vec<UsageRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT run.created_at, run.type, run.name, run.prompt_tokens, run.completion_tokens, \
             run.cost, rr.passed AS check_passed \
             FROM run LEFT JOIN (SELECT run_id, MIN(passed) AS passed FROM radar_result",
        );
        if let Some(radar_id) = radar_id {
            qb.push(" WHERE radar_id = ");
            qb.push_bind(radar_id.to_string());
        }
        qb.push(" GROUP BY run_id) rr ON rr.run_id = run.id WHERE run.project_id = ");
        qb.push_bind(project_id.to_string());
        qb.push(" AND run.created_at > ");
        qb.push_bind(encode_timestamp(&since));
        qb.push(" ORDER BY run.created_at ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let run_type: String = row.try_get("type")?;
                Ok(UsageRecord {
                    created_at: decode_timestamp(&row.try_get::<String, _>("created_at")?)?,
                    run_type: run_type.parse()?,
                    name: row.try_get("name")?,
                    prompt_tokens: row.try_get("prompt_tokens")?,
                    completion_tokens: row.try_get("completion_tokens")?,
                    cost: row.try_get("cost")?,
                    check_passed: row
                        .try_get::<Option<i64>, _>("check_passed")?
                        .map(|p| p != 0),
                })
            })
            .collect()
    }
}

/// Reconstruct a [`Run`] from a row selected with [`RUN_COLUMNS`].
pub(crate) fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let id = parse_uuid(&row.try_get::<String, _>("id")?)?;
    let project_id = parse_uuid(&row.try_get::<String, _>("project_id")?)?;
    let created_at = decode_timestamp(&row.try_get::<String, _>("created_at")?)?;
    let run_type: RunType = row.try_get::<String, _>("type")?.parse()?;

    let mut run = Run::new(id, project_id, run_type, created_at);
    run.ended_at = row
        .try_get::<Option<String>, _>("ended_at")?
        .map(|s| decode_timestamp(&s))
        .transpose()?;
    run.name = row.try_get("name")?;
    run.parent_run_id = row
        .try_get::<Option<String>, _>("parent_run_id")?
        .map(|s| parse_uuid(&s))
        .transpose()?;
    run.sibling_run_id = row
        .try_get::<Option<String>, _>("sibling_run_id")?
        .map(|s| parse_uuid(&s))
        .transpose()?;
    run.input = parse_json(row.try_get("input")?)?;
    run.output = parse_json(row.try_get("output")?)?;
    run.error = parse_json(row.try_get("error")?)?;
    run.tags = serde_json::from_str(&row.try_get::<String, _>("tags")?)?;
    run.params = parse_json(row.try_get("params")?)?;
    run.prompt_tokens = row.try_get("prompt_tokens")?;
    run.completion_tokens = row.try_get("completion_tokens")?;
    run.cost = row.try_get("cost")?;
    run.status = row
        .try_get::<Option<String>, _>("status")?
        .map(|s| s.parse::<RunStatus>())
        .transpose()?;
    run.feedback = parse_json(row.try_get("feedback")?)?;
    run.metadata = parse_json(row.try_get("metadata")?)?;
    run.template_version_id = row.try_get("template_version_id")?;
    run.runtime = row.try_get("runtime")?;
    run.cached_prompt_tokens = row.try_get("cached_prompt_tokens")?;
    Ok(run)
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StorageError::InvalidRow(format!("invalid UUID '{}': {}", s, e)))
}

pub(crate) fn json_text(value: Option<&Value>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

pub(crate) fn parse_json(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{project, ts, TestDb};
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let mut run = Run::new(Uuid::new_v4(), project_id, RunType::Llm, ts(0));
        run.name = Some("gpt-4".into());
        run.tags = vec!["prod".into()];
        run.input = Some(json!([{"role": "user", "content": "hi"}]));
        run.status = Some(RunStatus::Started);
        run.runtime = Some("runlens-py:1.2.0".into());
        db.storage.runs().insert_run(&run).await.unwrap();

        let loaded = db.storage.runs().get_run(project_id, run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);

        // Other projects do not see it
        let other = project(&db.storage).await;
        assert!(db.storage.runs().get_run(other, run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_fail_and_feedback() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let run = Run::new(Uuid::new_v4(), project_id, RunType::Llm, ts(0));
        let runs = db.storage.runs();
        runs.insert_run(&run).await.unwrap();

        let done = runs
            .complete_run(
                run.id,
                &RunCompletion {
                    ended_at: Some(ts(2)),
                    output: Some(json!("ok")),
                    prompt_tokens: Some(3),
                    completion_tokens: Some(4),
                    cached_prompt_tokens: Some(2),
                    cost: Some(0.5),
                },
            )
            .await
            .unwrap();
        assert!(done);

        runs.merge_feedback(run.id, &json!({"thumbs": "up"})).await.unwrap();
        runs.merge_feedback(run.id, &json!({"comment": "nice"})).await.unwrap();

        let loaded = runs.get_run(project_id, run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, Some(RunStatus::Success));
        assert_eq!(loaded.cost, Some(0.5));
        assert_eq!(loaded.cached_prompt_tokens, Some(2));
        assert_eq!(loaded.feedback, Some(json!({"thumbs": "up", "comment": "nice"})));

        assert!(runs.fail_run(run.id, ts(3), Some(&json!({"message": "boom"}))).await.unwrap());
        assert!(!runs.fail_run(Uuid::new_v4(), ts(3), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_end_before_start_is_clamped() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let runs = db.storage.runs();
        let completed = Run::new(Uuid::new_v4(), project_id, RunType::Llm, ts(10));
        let failed = Run::new(Uuid::new_v4(), project_id, RunType::Tool, ts(10));
        runs.insert_run(&completed).await.unwrap();
        runs.insert_run(&failed).await.unwrap();

        let completion = RunCompletion {
            ended_at: Some(ts(5)),
            ..Default::default()
        };
        runs.complete_run(completed.id, &completion).await.unwrap();
        runs.fail_run(failed.id, ts(5), None).await.unwrap();

        for id in [completed.id, failed.id] {
            let loaded = runs.get_run(project_id, id).await.unwrap().unwrap();
            assert_eq!(loaded.ended_at, Some(ts(10)));
            assert_eq!(loaded.duration_ms(), Some(0));
            loaded.validate().unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_cost_pages_and_guarded_update() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let runs = db.storage.runs();
        for i in 0..5 {
            let mut run = Run::new(Uuid::new_v4(), project_id, RunType::Llm, ts(i));
            run.name = Some("gpt-4".into());
            runs.insert_run(&run).await.unwrap();
        }
        let first = runs.runs_missing_cost(None, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        let last = first.last().unwrap();
        let cursor = CostCursor {
            created_at: last.created_at,
            id: last.id,
        };
        let second = runs.runs_missing_cost(Some(&cursor), 3).await.unwrap();
        assert_eq!(second.len(), 2);

        assert!(runs.set_cost_if_null(first[0].id, 1.0).await.unwrap());
        assert!(!runs.set_cost_if_null(first[0].id, 2.0).await.unwrap());
        assert_eq!(runs.runs_missing_cost(None, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_daily_counts_skip_empty_days() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let runs = db.storage.runs();
        let day = 86_400;
        for offset in [0, 10, 2 * day, 2 * day + 5] {
            runs.insert_run(&Run::new(Uuid::new_v4(), project_id, RunType::Chain, ts(offset)))
                .await
                .unwrap();
        }
        let counts = runs.daily_counts(Some(project_id), ts(-1)).await.unwrap();
        assert_eq!(
            counts,
            vec![
                DailyCount { date: "2024-01-03".into(), count: 2 },
                DailyCount { date: "2024-01-01".into(), count: 2 },
            ]
        );
    }
}
