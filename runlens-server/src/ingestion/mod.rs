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

//! Event ingestion
//!
//! SDK events arrive in batches and are applied to the run store one at a
//! time, oldest first, so a parent's `start` lands before its children. A
//! run's own `start` is moved ahead of its other events even when a skewed
//! clock stamped them earlier, and an end time before the start is stored
//! as the start. A
//! failing event is logged and reported in its [`IngestResult`]; it never
//! aborts the rest of the batch.

mod chat;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use runlens_core::{
    clean_event, CoreError, Event, EventKind, ModelPricingRegistry, Run, RunStatus, TokenUsage,
};
use runlens_storage::{RunCompletion, RunStore, StorageError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Invalid(String),

    #[error("Run {0} not found")]
    RunNotFound(Uuid),
}

/// Per-event outcome, in processing order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Applies cleaned SDK events to the run store
#[derive(Clone)]
pub struct EventProcessor {
    runs: RunStore,
    pricing: ModelPricingRegistry,
}

impl EventProcessor {
    pub fn new(runs: RunStore, pricing: ModelPricingRegistry) -> Self {
        Self { runs, pricing }
    }

    /// Process a batch of raw events for `project_id`.
    pub async fn process_events(&self, project_id: Uuid, events: Vec<Value>) -> Vec<IngestResult> {
        let mut cleaned: Vec<(Option<String>, Result<Event, CoreError>)> = events
            .iter()
            .map(|raw| (raw_run_id(raw), clean_event(raw)))
            .collect();
        order_events(&mut cleaned);

        let mut results = Vec::with_capacity(cleaned.len());
        let mut inserted = 0usize;
        for (raw_id, event) in cleaned {
            let outcome = match event {
                Ok(event) => self.register_event(project_id, &event).await,
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(()) => {
                    inserted += 1;
                    results.push(IngestResult {
                        id: raw_id,
                        success: true,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("Error ingesting event {:?}: {}", raw_id, e);
                    results.push(IngestResult {
                        id: raw_id,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        info!(
            "Ingested {} of {} events for project {}",
            inserted,
            results.len(),
            project_id
        );
        results
    }

    async fn register_event(&self, project_id: Uuid, event: &Event) -> Result<(), IngestError> {
        match event.kind {
            EventKind::Log => self.register_log(project_id, event).await,
            EventKind::Run(_) => self.register_run(project_id, event).await,
        }
    }

    async fn register_run(&self, project_id: Uuid, event: &Event) -> Result<(), IngestError> {
        if event.event == "chat" {
            return chat::reconcile(&self.runs, project_id, event).await;
        }

        let run_id = event
            .run_id
            .ok_or_else(|| IngestError::Invalid("runId is required".to_string()))?;

        match event.event.as_str() {
            "start" => self.start_run(project_id, run_id, event).await,
            "end" => self.end_run(project_id, run_id, event).await,
            "error" => {
                self.require_run(project_id, run_id).await?;
                self.runs
                    .fail_run(run_id, event.timestamp, event.error.as_ref())
                    .await?;
                Ok(())
            }
            "feedback" => {
                self.require_run(project_id, run_id).await?;
                let patch = feedback_patch(event.feedback.as_ref(), event.extra.as_ref());
                self.runs.merge_feedback(run_id, &patch).await?;
                Ok(())
            }
            other => Err(IngestError::Invalid(format!("unknown event '{}'", other))),
        }
    }

    async fn start_run(
        &self,
        project_id: Uuid,
        run_id: Uuid,
        event: &Event,
    ) -> Result<(), IngestError> {
        let run_type = event
            .kind
            .run_type()
            .ok_or_else(|| IngestError::Invalid("log events cannot start a run".to_string()))?;

        let mut parent_run_id = event.parent_run_id;
        if run_type.is_root_only() {
            parent_run_id = None;
        } else if let Some(parent) = parent_run_id {
            if !self.runs.run_exists(project_id, parent).await? {
                warn!(
                    "Parent run {} of {} not found in project {}, dropping link",
                    parent, run_id, project_id
                );
                parent_run_id = None;
            }
        }

        let mut run = Run::new(run_id, project_id, run_type, event.timestamp);
        run.name = event.name.clone();
        run.parent_run_id = parent_run_id;
        run.input = event.input.clone();
        run.tags = event.tags.clone().unwrap_or_default();
        run.params = event.params.clone().or_else(|| event.extra.clone());
        run.metadata = event.metadata.clone();
        run.template_version_id = event.template_id;
        run.status = Some(RunStatus::Started);
        run.runtime = event.runtime.clone();

        self.runs.insert_run(&run).await?;
        Ok(())
    }

    async fn end_run(&self, project_id: Uuid, run_id: Uuid, event: &Event) -> Result<(), IngestError> {
        let stored = self
            .runs
            .get_run(project_id, run_id)
            .await?
            .ok_or(IngestError::RunNotFound(run_id))?;

        let ended_at = event.timestamp.max(stored.created_at);
        let usage = event.tokens_usage.unwrap_or_default();
        let cost = self.price(stored, ended_at, &usage);

        self.runs
            .complete_run(
                run_id,
                &RunCompletion {
                    ended_at: Some(ended_at),
                    output: event.output.clone(),
                    prompt_tokens: usage.prompt,
                    completion_tokens: usage.completion,
                    cached_prompt_tokens: usage.cached_prompt,
                    cost,
                },
            )
            .await?;
        Ok(())
    }

    /// Cost of a stored run as it would be once ended with the given usage.
    fn price(
        &self,
        mut run: Run,
        ended_at: DateTime<Utc>,
        usage: &TokenUsage,
    ) -> Option<f64> {
        run.ended_at = Some(ended_at);
        run.prompt_tokens = usage.prompt;
        run.completion_tokens = usage.completion;
        run.cached_prompt_tokens = usage.cached_prompt;
        let cost = self.pricing.calculate_run_cost(&run);
        if cost.is_none() {
            debug!("No cost for run {} ({:?})", run.id, run.name);
        }
        cost
    }

    async fn require_run(&self, project_id: Uuid, run_id: Uuid) -> Result<(), IngestError> {
        if self.runs.run_exists(project_id, run_id).await? {
            Ok(())
        } else {
            Err(IngestError::RunNotFound(run_id))
        }
    }

    async fn register_log(&self, project_id: Uuid, event: &Event) -> Result<(), IngestError> {
        let run_id = event
            .parent_run_id
            .ok_or_else(|| IngestError::Invalid("log events require parentRunId".to_string()))?;
        if event.event.is_empty() {
            return Err(IngestError::Invalid("log events require a level".to_string()));
        }
        self.require_run(project_id, run_id).await?;

        let message = event.message.as_ref().map(|m| match m {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        let extra = event
            .metadata
            .clone()
            .or_else(|| event.extra.clone())
            .unwrap_or_else(|| Value::Object(Map::new()));

        self.runs
            .insert_log(
                project_id,
                run_id,
                &event.event,
                message.as_deref(),
                Some(&extra),
                event.timestamp,
            )
            .await?;
        Ok(())
    }
}

/// Sort a batch oldest first. A `start` is keyed by the earliest timestamp
/// of any event for its run, so it stays ahead of them. The sort is stable:
/// ties keep their batch order, starts first.
fn order_events(cleaned: &mut [(Option<String>, Result<Event, CoreError>)]) {
    let mut earliest: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    for event in cleaned.iter().filter_map(|(_, event)| event.as_ref().ok()) {
        if let Some(run_id) = event.run_id {
            earliest
                .entry(run_id)
                .and_modify(|at| *at = (*at).min(event.timestamp))
                .or_insert(event.timestamp);
        }
    }
    cleaned.sort_by_key(|(_, event)| {
        event.as_ref().ok().map(|e| {
            let is_start = e.event == "start";
            let at = match e.run_id.and_then(|id| earliest.get(&id)) {
                Some(first) if is_start => *first,
                _ => e.timestamp,
            };
            (at, !is_start)
        })
    });
}

/// Feedback object merged from `feedback` and the legacy `extra` field.
fn feedback_patch(feedback: Option<&Value>, extra: Option<&Value>) -> Value {
    let mut patch = Map::new();
    for source in [feedback, extra].into_iter().flatten() {
        if let Value::Object(map) = source {
            patch.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    Value::Object(patch)
}

fn raw_run_id(raw: &Value) -> Option<String> {
    ["runId", "run_id", "convoId"]
        .iter()
        .find_map(|key| raw.get(*key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlens_core::RunType;
    use runlens_storage::Storage;
    use serde_json::json;

    async fn setup() -> (Storage, EventProcessor, Uuid) {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("ingest").await.unwrap().id;
        let processor = EventProcessor::new(storage.runs(), ModelPricingRegistry::new());
        (storage, processor, project)
    }

    #[tokio::test]
    async fn test_start_and_end_prices_llm_run() {
        let (storage, processor, project) = setup().await;
        let run_id = Uuid::new_v4();

        // Out of order on purpose: the batch is sorted before processing
        let results = processor
            .process_events(
                project,
                vec![
                    json!({
                        "type": "llm", "event": "end", "runId": run_id.to_string(),
                        "timestamp": "2024-05-01T10:00:02Z",
                        "output": {"role": "assistant", "content": "hello"},
                        "tokensUsage": {"prompt": 1000, "completion": 500}
                    }),
                    json!({
                        "type": "llm", "event": "start", "runId": run_id.to_string(),
                        "timestamp": "2024-05-01T10:00:00Z", "name": "gpt-4",
                        "input": [{"role": "user", "content": "hi"}]
                    }),
                ],
            )
            .await;
        assert!(results.iter().all(|r| r.success), "{:?}", results);

        let run = storage.runs().get_run(project, run_id).await.unwrap().unwrap();
        assert_eq!(run.status, Some(RunStatus::Success));
        assert_eq!(run.prompt_tokens, Some(1000));
        assert_eq!(run.cost, Some(0.06));
        assert_eq!(run.duration_ms(), Some(2000));
    }

    #[tokio::test]
    async fn test_end_stamped_before_start_across_batches() {
        let (storage, processor, project) = setup().await;
        let run_id = Uuid::new_v4().to_string();
        processor
            .process_events(
                project,
                vec![json!({
                    "type": "llm", "event": "start", "runId": run_id,
                    "timestamp": "2024-05-01T10:00:10Z", "name": "gpt-4",
                    "runtime": "runlens-js:3.1.0"
                })],
            )
            .await;
        let results = processor
            .process_events(
                project,
                vec![json!({
                    "type": "llm", "event": "end", "runId": run_id,
                    "timestamp": "2024-05-01T10:00:05Z",
                    "tokensUsage": {"prompt": 1000, "completion": 500}
                })],
            )
            .await;
        assert!(results[0].success, "{:?}", results);

        let id = Uuid::parse_str(&run_id).unwrap();
        let run = storage.runs().get_run(project, id).await.unwrap().unwrap();
        assert_eq!(run.ended_at, Some(run.created_at));
        assert_eq!(run.duration_ms(), Some(0));
        assert_eq!(run.cost, Some(0.06));
        assert_eq!(run.runtime.as_deref(), Some("runlens-js:3.1.0"));
        run.validate().unwrap();
    }

    #[tokio::test]
    async fn test_end_stamped_before_start_in_one_batch() {
        let (storage, processor, project) = setup().await;
        let run_id = Uuid::new_v4().to_string();
        let results = processor
            .process_events(
                project,
                vec![
                    json!({
                        "type": "llm", "event": "start", "runId": run_id,
                        "timestamp": "2024-05-01T10:00:10Z", "name": "gpt-4"
                    }),
                    json!({
                        "type": "llm", "event": "end", "runId": run_id,
                        "timestamp": "2024-05-01T10:00:05Z",
                        "output": {"role": "assistant", "content": "hi"},
                        "tokensUsage": {"prompt": 1000, "completion": 500}
                    }),
                    json!({
                        "type": "llm", "event": "feedback", "runId": run_id,
                        "timestamp": "2024-05-01T10:00:04Z",
                        "feedback": {"thumbs": "up"}
                    }),
                ],
            )
            .await;
        assert!(results.iter().all(|r| r.success), "{:?}", results);

        let id = Uuid::parse_str(&run_id).unwrap();
        let run = storage.runs().get_run(project, id).await.unwrap().unwrap();
        assert_eq!(run.status, Some(RunStatus::Success));
        assert_eq!(run.ended_at, Some(run.created_at));
        assert_eq!(run.feedback, Some(json!({"thumbs": "up"})));
        assert_eq!(run.cost, Some(0.06));
    }

    #[tokio::test]
    async fn test_missing_parent_is_dropped() {
        let (storage, processor, project) = setup().await;
        let run_id = Uuid::new_v4();
        let results = processor
            .process_events(
                project,
                vec![json!({
                    "type": "tool", "event": "start", "runId": run_id.to_string(),
                    "parentRunId": Uuid::new_v4().to_string(),
                    "timestamp": "2024-05-01T10:00:00Z"
                })],
            )
            .await;
        assert!(results[0].success);
        let run = storage.runs().get_run(project, run_id).await.unwrap().unwrap();
        assert_eq!(run.parent_run_id, None);
        assert_eq!(run.run_type, RunType::Tool);
    }

    #[tokio::test]
    async fn test_bad_event_does_not_abort_batch() {
        let (storage, processor, project) = setup().await;
        let good = Uuid::new_v4();
        let results = processor
            .process_events(
                project,
                vec![
                    json!({"type": "llm", "event": "start", "runId": "x", "timestamp": "yesterday"}),
                    json!({"type": "spaceship", "event": "start", "timestamp": "2024-05-01T10:00:00Z"}),
                    json!({
                        "type": "chain", "event": "start", "runId": good.to_string(),
                        "timestamp": "2024-05-01T10:00:00Z"
                    }),
                    json!({
                        "type": "llm", "event": "end", "runId": Uuid::new_v4().to_string(),
                        "timestamp": "2024-05-01T10:00:01Z"
                    }),
                ],
            )
            .await;
        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|r| r.success).count(), 1);
        assert!(results.iter().filter(|r| !r.success).all(|r| r.error.is_some()));
        assert!(storage.runs().run_exists(project, good).await.unwrap());
    }

    #[tokio::test]
    async fn test_error_feedback_and_log_events() {
        let (storage, processor, project) = setup().await;
        let run_id = Uuid::new_v4().to_string();
        let results = processor
            .process_events(
                project,
                vec![
                    json!({"type": "agent", "event": "start", "runId": run_id, "timestamp": "2024-05-01T10:00:00Z"}),
                    json!({
                        "type": "agent", "event": "error", "runId": run_id,
                        "timestamp": "2024-05-01T10:00:03Z",
                        "error": {"message": "boom"}
                    }),
                    json!({
                        "type": "agent", "event": "feedback", "runId": run_id,
                        "timestamp": "2024-05-01T10:00:04Z",
                        "feedback": {"thumbs": "down"}, "extra": {"comment": "slow"}
                    }),
                    json!({
                        "type": "log", "event": "warn", "parentRunId": run_id,
                        "timestamp": "2024-05-01T10:00:05Z", "message": "retrying"
                    }),
                ],
            )
            .await;
        assert!(results.iter().all(|r| r.success), "{:?}", results);

        let id = Uuid::parse_str(&run_id).unwrap();
        let run = storage.runs().get_run(project, id).await.unwrap().unwrap();
        assert_eq!(run.status, Some(RunStatus::Error));
        assert_eq!(run.error, Some(json!({"message": "boom"})));
        assert_eq!(run.feedback, Some(json!({"thumbs": "down", "comment": "slow"})));
    }

    #[tokio::test]
    async fn test_events_for_other_project_runs_fail() {
        let (storage, processor, project) = setup().await;
        let other = storage.projects().create("other").await.unwrap().id;
        let run_id = Uuid::new_v4().to_string();
        processor
            .process_events(
                other,
                vec![json!({"type": "llm", "event": "start", "runId": run_id, "timestamp": "2024-05-01T10:00:00Z"})],
            )
            .await;

        let results = processor
            .process_events(
                project,
                vec![json!({"type": "llm", "event": "error", "runId": run_id, "timestamp": "2024-05-01T10:00:01Z"})],
            )
            .await;
        assert!(!results[0].success);
    }

    #[test]
    fn test_feedback_patch_merges_legacy_extra() {
        let patch = feedback_patch(Some(&json!({"a": 1})), Some(&json!({"b": 2, "a": 3})));
        assert_eq!(patch, json!({"a": 3, "b": 2}));
        assert_eq!(feedback_patch(None, None), json!({}));
    }
}
