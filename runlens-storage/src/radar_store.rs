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

//! Radars: saved check trees applied to matching runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use runlens_core::Run;

use crate::error::Result;
use crate::filters::push_logic_sql;
use crate::run_store::{parse_uuid, run_from_row, RUN_COLUMNS};
use crate::schema::{decode_timestamp, encode_timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Radar {
    pub id: Uuid,
    pub project_id: Uuid,
    pub description: Option<String>,
    /// Which runs the radar looks at
    pub view: Value,
    /// What it checks on them
    pub checks: Value,
    pub negative: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadarResult {
    pub radar_id: Uuid,
    pub run_id: Uuid,
    pub results: Value,
    pub passed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RadarStore {
    pool: SqlitePool,
}

impl RadarStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_radar(&self, radar: &Radar) -> Result<()> {
        sqlx::query(
            "INSERT INTO radar (id, project_id, description, view, checks, negative, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(radar.id.to_string())
        .bind(radar.project_id.to_string())
        .bind(radar.description.as_deref())
        .bind(serde_json::to_string(&radar.view)?)
        .bind(serde_json::to_string(&radar.checks)?)
        .bind(radar.negative)
        .bind(encode_timestamp(&radar.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every radar, optionally restricted to one project.
    pub async fn list_radars(&self, project_id: Option<Uuid>) -> Result<Vec<Radar>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, project_id, description, view, checks, negative, created_at FROM radar",
        );
        if let Some(project_id) = project_id {
            qb.push(" WHERE project_id = ");
            qb.push_bind(project_id.to_string());
        }
        qb.push(" ORDER BY created_at ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(radar_from_row).collect()
    }

    /// Oldest runs in the radar's view that have no result for it yet.
    pub async fn pending_runs(&self, radar: &Radar, limit: i64) -> Result<Vec<Run>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM run WHERE run.project_id = ",
            RUN_COLUMNS
        ));
        qb.push_bind(radar.project_id.to_string());
        qb.push(" AND ");
        push_logic_sql(&mut qb, &radar.view)?;
        qb.push(" AND run.id NOT IN (SELECT run_id FROM radar_result WHERE radar_id = ");
        qb.push_bind(radar.id.to_string());
        qb.push(") ORDER BY run.created_at ASC, run.id ASC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Whether `run_id` satisfies the SQL form of `logic`.
    pub async fn run_matches(&self, run_id: Uuid, logic: &Value) -> Result<bool> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT 1 FROM run WHERE run.id = ");
        qb.push_bind(run_id.to_string());
        qb.push(" AND ");
        push_logic_sql(&mut qb, logic)?;
        let found = qb.build().fetch_optional(&self.pool).await?;
        Ok(found.is_some())
    }

    /// Replace every `radar` check in `logic` with its stored verdict for
    /// `run_id`, leaving a tree the in-process check engine can decide.
    pub async fn resolve_radar_checks(&self, run_id: Uuid, logic: &Value) -> Result<Value> {
        let mut leaves = Vec::new();
        collect_radar_checks(logic, &mut leaves);
        let mut verdicts = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let matched = self.run_matches(run_id, leaf).await?;
            verdicts.push((leaf.clone(), matched));
        }
        Ok(substitute_verdicts(logic, &verdicts))
    }

    /// Record a result. A second result for the same radar and run is ignored.
    pub async fn insert_result(&self, result: &RadarResult) -> Result<bool> {
        let outcome = sqlx::query(
            "INSERT INTO radar_result (radar_id, run_id, created_at, results, passed)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(radar_id, run_id) DO NOTHING",
        )
        .bind(result.radar_id.to_string())
        .bind(result.run_id.to_string())
        .bind(encode_timestamp(&result.created_at))
        .bind(serde_json::to_string(&result.results)?)
        .bind(result.passed)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    pub async fn results_for_run(&self, run_id: Uuid) -> Result<Vec<RadarResult>> {
        let rows = sqlx::query(
            "SELECT radar_id, run_id, created_at, results, passed FROM radar_result
             WHERE run_id = ?1 ORDER BY created_at ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RadarResult {
                    radar_id: parse_uuid(&row.try_get::<String, _>("radar_id")?)?,
                    run_id: parse_uuid(&row.try_get::<String, _>("run_id")?)?,
                    created_at: decode_timestamp(&row.try_get::<String, _>("created_at")?)?,
                    results: serde_json::from_str(&row.try_get::<String, _>("results")?)?,
                    passed: row.try_get("passed")?,
                })
            })
            .collect()
    }
}

fn is_radar_check(node: &Value) -> bool {
    node.get("id").and_then(Value::as_str) == Some("radar")
}

fn collect_radar_checks<'a>(logic: &'a Value, out: &mut Vec<&'a Value>) {
    match logic {
        Value::Array(items) => items.iter().for_each(|item| collect_radar_checks(item, out)),
        Value::Object(_) if is_radar_check(logic) => out.push(logic),
        _ => {}
    }
}

fn substitute_verdicts(logic: &Value, verdicts: &[(Value, bool)]) -> Value {
    match logic {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_verdicts(item, verdicts))
                .collect(),
        ),
        Value::Object(_) if is_radar_check(logic) => verdicts
            .iter()
            .find(|(leaf, _)| leaf == logic)
            .map_or_else(|| logic.clone(), |(_, matched)| Value::Bool(*matched)),
        other => other.clone(),
    }
}

fn radar_from_row(row: &SqliteRow) -> Result<Radar> {
    Ok(Radar {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?)?,
        description: row.try_get("description")?,
        view: serde_json::from_str(&row.try_get::<String, _>("view")?)?,
        checks: serde_json::from_str(&row.try_get::<String, _>("checks")?)?,
        negative: row.try_get("negative")?,
        created_at: decode_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{project, ts, TestDb};
    use runlens_core::RunType;
    use serde_json::json;

    fn radar(project_id: Uuid, view: Value) -> Radar {
        Radar {
            id: Uuid::new_v4(),
            project_id,
            description: Some("llm runs".into()),
            view,
            checks: json!(["AND", {"id": "json", "params": {"field": "output", "type": "valid"}}]),
            negative: false,
            created_at: ts(0),
        }
    }

    #[tokio::test]
    async fn test_pending_runs_follow_view_and_results() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let runs = db.storage.runs();
        let radars = db.storage.radars();

        let mut llm_ids = Vec::new();
        for i in 0..3 {
            let mut run = Run::new(Uuid::new_v4(), project_id, RunType::Llm, ts(i));
            run.name = Some("gpt-4".into());
            run.tags = vec!["prod".into()];
            runs.insert_run(&run).await.unwrap();
            llm_ids.push(run.id);
        }
        runs.insert_run(&Run::new(Uuid::new_v4(), project_id, RunType::Tool, ts(5)))
            .await
            .unwrap();

        let radar = radar(
            project_id,
            json!(["AND", {"id": "type", "params": {"type": "llm"}}, {"id": "tags", "params": {"tags": ["prod"]}}]),
        );
        radars.create_radar(&radar).await.unwrap();

        let pending = radars.pending_runs(&radar, 20).await.unwrap();
        assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), llm_ids);

        let result = RadarResult {
            radar_id: radar.id,
            run_id: llm_ids[0],
            results: json!([]),
            passed: true,
            created_at: ts(10),
        };
        assert!(radars.insert_result(&result).await.unwrap());
        assert!(!radars.insert_result(&result).await.unwrap());

        let pending = radars.pending_runs(&radar, 20).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(radars.results_for_run(llm_ids[0]).await.unwrap().len(), 1);
        assert_eq!(radars.list_radars(Some(project_id)).await.unwrap(), vec![radar]);
    }

    #[tokio::test]
    async fn test_run_matches_numeric_checks() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let mut run = Run::new(Uuid::new_v4(), project_id, RunType::Llm, ts(0));
        run.ended_at = Some(ts(4));
        run.prompt_tokens = Some(10);
        run.completion_tokens = Some(5);
        run.cost = Some(0.2);
        db.storage.runs().insert_run(&run).await.unwrap();
        let radars = db.storage.radars();

        let slow = json!(["AND", {"id": "duration", "params": {"operator": "gt", "duration": 3}}]);
        let cheap = json!(["AND", {"id": "cost", "params": {"operator": "lt", "cost": 0.1}}]);
        let total = json!(["OR",
            {"id": "tokens", "params": {"field": "total", "operator": "eq", "tokens": 15}},
            {"id": "status", "params": {"status": "error"}}
        ]);
        assert!(radars.run_matches(run.id, &slow).await.unwrap());
        assert!(!radars.run_matches(run.id, &cheap).await.unwrap());
        assert!(radars.run_matches(run.id, &total).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_radar_checks_keeps_other_leaves() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let run = Run::new(Uuid::new_v4(), project_id, RunType::Llm, ts(0));
        db.storage.runs().insert_run(&run).await.unwrap();
        let radars = db.storage.radars();

        let upstream = radar(project_id, json!(["AND"]));
        radars.create_radar(&upstream).await.unwrap();
        radars
            .insert_result(&RadarResult {
                radar_id: upstream.id,
                run_id: run.id,
                results: json!([]),
                passed: true,
                created_at: ts(1),
            })
            .await
            .unwrap();

        let length = json!({"id": "length", "params": {"operator": "gt", "length": 5}});
        let logic = json!([
            "AND",
            {"id": "radar", "params": {"ids": [upstream.id.to_string()]}},
            ["OR", {"id": "radar", "params": {"ids": [Uuid::new_v4().to_string()]}}, length.clone()]
        ]);
        let resolved = radars.resolve_radar_checks(run.id, &logic).await.unwrap();
        assert_eq!(resolved, json!(["AND", true, ["OR", false, length]]));
    }
}
