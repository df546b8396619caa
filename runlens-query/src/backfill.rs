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

//! Cost backfill
//!
//! Prices LLM runs stored without a cost, in fixed-size batches. The scan
//! advances a `(created_at, id)` cursor so runs that cannot be priced are not
//! revisited within one pass, and writes are guarded by `cost IS NULL` so a
//! second pass over the same rows changes nothing.

use serde::Serialize;
use tracing::{debug, info};

use runlens_core::ModelPricingRegistry;
use runlens_storage::{CostCursor, RunStore};

use crate::error::{QueryError, Result};

pub const DEFAULT_BATCH_SIZE: i64 = 1000;

/// Outcome of one backfill pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub batches: u64,
    pub scanned: u64,
    pub updated: u64,
    /// Runs left without a cost because no price applies
    pub unpriced: u64,
}

pub struct CostBackfill {
    runs: RunStore,
    pricing: ModelPricingRegistry,
    batch_size: i64,
}

impl CostBackfill {
    pub fn new(runs: RunStore, pricing: ModelPricingRegistry) -> Self {
        Self {
            runs,
            pricing,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Result<Self> {
        if batch_size <= 0 {
            return Err(QueryError::InvalidArgument(format!(
                "batch size must be positive, got {}",
                batch_size
            )));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    /// Run one full pass over the runs missing a cost.
    pub async fn run(&self) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();
        let mut cursor: Option<CostCursor> = None;

        loop {
            let page = self
                .runs
                .runs_missing_cost(cursor.as_ref(), self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(CostCursor {
                created_at: last.created_at,
                id: last.id,
            });

            let mut batch_updated = 0;
            for run in &page {
                report.scanned += 1;
                match self.pricing.calculate_run_cost(run) {
                    Some(cost) => {
                        if self.runs.set_cost_if_null(run.id, cost).await? {
                            batch_updated += 1;
                        }
                    }
                    None => {
                        debug!("No price for run {} ({:?})", run.id, run.name);
                        report.unpriced += 1;
                    }
                }
            }
            report.updated += batch_updated;
            report.batches += 1;
            info!(
                "Cost backfill batch {}: {} runs, {} updated",
                report.batches,
                page.len(),
                batch_updated
            );

            if (page.len() as i64) < self.batch_size {
                break;
            }
        }

        info!(
            "Cost backfill finished: scanned={} updated={} unpriced={}",
            report.scanned, report.updated, report.unpriced
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use runlens_core::{Run, RunType};
    use runlens_storage::Storage;
    use uuid::Uuid;

    async fn seed(storage: &Storage, project: Uuid, name: &str, offset: i64) -> Uuid {
        let mut run = Run::new(
            Uuid::new_v4(),
            project,
            RunType::Llm,
            Utc::now() + Duration::seconds(offset),
        );
        run.name = Some(name.to_string());
        run.prompt_tokens = Some(1000);
        run.completion_tokens = Some(500);
        storage.runs().insert_run(&run).await.unwrap();
        run.id
    }

    #[tokio::test]
    async fn test_backfill_is_idempotent() {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("backfill").await.unwrap().id;
        let mut priced = Vec::new();
        for i in 0..5 {
            priced.push(seed(&storage, project, "gpt-4", i).await);
        }
        seed(&storage, project, "in-house-model", 10).await;

        let backfill = CostBackfill::new(storage.runs(), ModelPricingRegistry::new())
            .with_batch_size(2)
            .unwrap();

        let first = backfill.run().await.unwrap();
        assert_eq!(first.scanned, 6);
        assert_eq!(first.updated, 5);
        assert_eq!(first.unpriced, 1);
        assert_eq!(first.batches, 3);

        let run = storage.runs().get_run(project, priced[0]).await.unwrap().unwrap();
        assert_eq!(run.cost, Some(0.06));

        let second = backfill.run().await.unwrap();
        assert_eq!(second.updated, 0);
        assert_eq!(second.scanned, 1);
        let again = storage.runs().get_run(project, priced[0]).await.unwrap().unwrap();
        assert_eq!(again.cost, Some(0.06));
    }

    #[tokio::test]
    async fn test_existing_costs_are_kept() {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("backfill").await.unwrap().id;
        let mut run = Run::new(Uuid::new_v4(), project, RunType::Llm, Utc::now());
        run.name = Some("gpt-4".into());
        run.prompt_tokens = Some(1000);
        run.completion_tokens = Some(500);
        run.cost = Some(1.5);
        storage.runs().insert_run(&run).await.unwrap();

        let report = CostBackfill::new(storage.runs(), ModelPricingRegistry::new())
            .run()
            .await
            .unwrap();
        assert_eq!(report.scanned, 0);
        let loaded = storage.runs().get_run(project, run.id).await.unwrap().unwrap();
        assert_eq!(loaded.cost, Some(1.5));
    }

    #[tokio::test]
    async fn test_batch_size_must_be_positive() {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        assert!(CostBackfill::new(storage.runs(), ModelPricingRegistry::new())
            .with_batch_size(0)
            .is_err());
    }
}
