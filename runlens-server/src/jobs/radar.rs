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

//! Radar job
//!
//! A radar watches the runs matching its `view` and records, once per run,
//! whether its `checks` pass. Each pass picks up at most `batch_size` unseen
//! runs per radar, oldest first, and evaluates up to `parallelism` of them
//! at a time. Check trees whose every leaf has a SQL form are decided by a
//! single SQL query; the rest go through the in-process check engine, with
//! `radar` leaves resolved against stored results first.
//!
//! A negative radar watches for something unwanted, so a run passes it when
//! its checks do not match.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use runlens_core::Run;
use runlens_evals::{CheckEngine, EvalError};
use runlens_storage::{is_sql_logic, Radar, RadarResult, RadarStore, StorageError};

pub const DEFAULT_BATCH_SIZE: i64 = 20;
pub const DEFAULT_PARALLELISM: usize = 3;

#[derive(Debug, Error)]
pub enum RadarError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Totals of one radar pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RadarReport {
    pub radars: u64,
    pub evaluated: u64,
    pub passed: u64,
    pub failed: u64,
    /// Runs left without a result, to be retried next pass
    pub errors: u64,
}

pub struct RadarJob {
    radars: RadarStore,
    checks: Arc<CheckEngine>,
    batch_size: i64,
    parallelism: usize,
}

impl RadarJob {
    pub fn new(radars: RadarStore, checks: Arc<CheckEngine>) -> Self {
        Self {
            radars,
            checks,
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// One pass over every radar, optionally limited to one project.
    pub async fn run_once(&self, project_id: Option<Uuid>) -> Result<RadarReport, StorageError> {
        let mut report = RadarReport::default();
        for radar in self.radars.list_radars(project_id).await? {
            report.radars += 1;
            if let Err(e) = self.run_radar(&radar, &mut report).await {
                warn!("Radar {} failed: {}", radar.id, e);
            }
        }
        info!(
            "Radar pass finished: radars={} evaluated={} passed={} failed={} errors={}",
            report.radars, report.evaluated, report.passed, report.failed, report.errors
        );
        Ok(report)
    }

    async fn run_radar(&self, radar: &Radar, report: &mut RadarReport) -> Result<(), StorageError> {
        let runs = self.radars.pending_runs(radar, self.batch_size).await?;
        if runs.is_empty() {
            return Ok(());
        }
        debug!("Radar {}: {} runs to check", radar.id, runs.len());

        let outcomes: Vec<(Uuid, Result<bool, RadarError>)> = stream::iter(runs)
            .map(|run| async move {
                let id = run.id;
                (id, self.judge_run(radar, &run).await)
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        for (run_id, outcome) in outcomes {
            match outcome {
                Ok(true) => {
                    report.evaluated += 1;
                    report.passed += 1;
                }
                Ok(false) => {
                    report.evaluated += 1;
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Radar {} could not check run {}: {}", radar.id, run_id, e);
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Evaluate the radar's checks on one run and store the result.
    async fn judge_run(&self, radar: &Radar, run: &Run) -> Result<bool, RadarError> {
        let (matched, results) = if is_sql_logic(&radar.checks) {
            let matched = self.radars.run_matches(run.id, &radar.checks).await?;
            (matched, Value::Array(Vec::new()))
        } else {
            let checks = self.radars.resolve_radar_checks(run.id, &radar.checks).await?;
            let outcome = self.checks.run_checks(run, &checks).await?;
            let results = serde_json::to_value(&outcome.results).map_err(EvalError::from)?;
            (outcome.passed, results)
        };
        let passed = matched != radar.negative;
        debug!("Radar {} run {} passed: {}", radar.id, run.id, passed);

        self.radars
            .insert_result(&RadarResult {
                radar_id: radar.id,
                run_id: run.id,
                results,
                passed,
                created_at: Utc::now(),
            })
            .await?;
        Ok(passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use runlens_core::RunType;
    use runlens_evals::{EvalConfig, EvaluatorRegistry, EvaluatorRunner};
    use runlens_storage::Storage;
    use serde_json::json;

    fn engine() -> Arc<CheckEngine> {
        let registry = Arc::new(EvaluatorRegistry::with_defaults(None));
        let runner = Arc::new(EvaluatorRunner::new(registry, EvalConfig::default()));
        Arc::new(CheckEngine::new(runner))
    }

    async fn seed(storage: &Storage, project: Uuid, count: usize) -> Vec<Uuid> {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mut ids = Vec::new();
        for i in 0..count {
            let mut run = Run::new(
                Uuid::new_v4(),
                project,
                RunType::Llm,
                start + Duration::seconds(i as i64),
            );
            run.name = Some("gpt-4o".into());
            run.output = Some(if i % 2 == 0 {
                json!("Contact me at jane@example.com")
            } else {
                json!("Nothing to see here")
            });
            storage.runs().insert_run(&run).await.unwrap();
            ids.push(run.id);
        }
        ids
    }

    fn radar(project: Uuid, checks: Value) -> Radar {
        Radar {
            id: Uuid::new_v4(),
            project_id: project,
            description: Some("pii watch".into()),
            view: json!(["AND", {"id": "type", "params": {"type": "llm"}}]),
            checks,
            negative: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_evaluator_radar_records_each_run_once() {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("radar").await.unwrap().id;
        let ids = seed(&storage, project, 25).await;
        let radar = radar(
            project,
            json!(["AND", {"id": "pii", "params": {"field": "output", "type": "contains"}}]),
        );
        storage.radars().create_radar(&radar).await.unwrap();

        let job = RadarJob::new(storage.radars(), engine());
        let first = job.run_once(Some(project)).await.unwrap();
        assert_eq!(first.evaluated, 20);
        assert_eq!(first.errors, 0);

        let second = job.run_once(Some(project)).await.unwrap();
        assert_eq!(second.evaluated, 5);

        let third = job.run_once(Some(project)).await.unwrap();
        assert_eq!(third.evaluated, 0);

        let results = storage.radars().results_for_run(ids[0]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        let results = storage.radars().results_for_run(ids[1]).await.unwrap();
        assert!(!results[0].passed);
    }

    #[tokio::test]
    async fn test_sql_only_radar() {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("radar").await.unwrap().id;
        seed(&storage, project, 3).await;
        let radar = radar(
            project,
            json!(["AND", {"id": "models", "params": {"names": ["gpt-4o"]}}]),
        );
        storage.radars().create_radar(&radar).await.unwrap();

        let job = RadarJob::new(storage.radars(), engine()).with_parallelism(1);
        let report = job.run_once(None).await.unwrap();
        assert_eq!(report.radars, 1);
        assert_eq!(report.passed, 3);
    }

    #[tokio::test]
    async fn test_failing_evaluator_leaves_run_pending() {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("radar").await.unwrap().id;
        seed(&storage, project, 2).await;
        // No LLM client is configured, so the assertion check errors
        let radar = radar(
            project,
            json!(["AND", {"id": "assertion", "params": {"assertion": "is polite"}}]),
        );
        storage.radars().create_radar(&radar).await.unwrap();

        let job = RadarJob::new(storage.radars(), engine());
        let report = job.run_once(Some(project)).await.unwrap();
        assert_eq!(report.errors, 2);
        assert_eq!(report.evaluated, 0);
        assert_eq!(storage.radars().pending_runs(&radar, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_length_checks_are_not_decided_in_sql() {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("radar").await.unwrap().id;
        seed(&storage, project, 3).await;
        let radar = radar(
            project,
            json!(["AND", {"id": "length", "params": {"field": "output", "operator": "gt", "length": 1000}}]),
        );
        storage.radars().create_radar(&radar).await.unwrap();

        let job = RadarJob::new(storage.radars(), engine());
        let report = job.run_once(Some(project)).await.unwrap();
        assert_eq!(report.evaluated, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(report.passed, 0);
    }

    #[tokio::test]
    async fn test_mixed_tree_with_radar_leaf() {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("radar").await.unwrap().id;
        let ids = seed(&storage, project, 2).await;

        let upstream = radar(
            project,
            json!(["AND", {"id": "models", "params": {"names": ["gpt-4o"]}}]),
        );
        storage.radars().create_radar(&upstream).await.unwrap();
        let job = RadarJob::new(storage.radars(), engine());
        job.run_once(Some(project)).await.unwrap();

        let mut downstream = radar(
            project,
            json!([
                "AND",
                {"id": "radar", "params": {"ids": [upstream.id.to_string()]}},
                {"id": "length", "params": {"field": "output", "operator": "lt", "length": 25}}
            ]),
        );
        downstream.created_at = upstream.created_at + Duration::seconds(1);
        storage.radars().create_radar(&downstream).await.unwrap();
        let report = job.run_once(Some(project)).await.unwrap();
        assert_eq!(report.evaluated, 2);

        let passed = |results: Vec<RadarResult>| {
            results
                .iter()
                .find(|r| r.radar_id == downstream.id)
                .map(|r| r.passed)
        };
        // "Contact me at jane@example.com" is 30 characters
        let results = storage.radars().results_for_run(ids[0]).await.unwrap();
        assert_eq!(passed(results), Some(false));
        let results = storage.radars().results_for_run(ids[1]).await.unwrap();
        assert_eq!(passed(results), Some(true));
    }

    #[tokio::test]
    async fn test_negative_radar_passes_runs_without_a_match() {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("radar").await.unwrap().id;
        let ids = seed(&storage, project, 2).await;
        let mut radar = radar(
            project,
            json!(["AND", {"id": "pii", "params": {"field": "output", "type": "contains"}}]),
        );
        radar.negative = true;
        storage.radars().create_radar(&radar).await.unwrap();

        let job = RadarJob::new(storage.radars(), engine());
        let report = job.run_once(Some(project)).await.unwrap();
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 1);
        let results = storage.radars().results_for_run(ids[0]).await.unwrap();
        assert!(!results[0].passed);
        let results = storage.radars().results_for_run(ids[1]).await.unwrap();
        assert!(results[0].passed);
    }
}
