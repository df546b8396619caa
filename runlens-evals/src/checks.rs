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

//! Check logic evaluation
//!
//! A check tree is `["AND" | "OR", element, ...]` where each element is a
//! check `{id, params}` or a nested tree. `OR` stops at the first passing
//! element and `AND` at the first failing one. Checks over stored run fields
//! (type, model, tags, status, date, duration, cost, tokens, length) are
//! decided in-process; every other id is looked up in the evaluator registry.
//! Ids that are neither fail with an "unknown check" reason. A literal
//! boolean element stands for a check already decided elsewhere.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use runlens_core::{Run, RunType};

use crate::evaluators::{num_param, str_param};
use crate::runner::EvaluatorRunner;
use crate::text::{last_message, run_field};
use crate::EvalError;

/// Result of one leaf check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<Value>,
}

/// Result of a whole check tree: the verdict plus every leaf that ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub results: Vec<CheckResult>,
}

/// Whether `id` is decided from stored run fields alone.
pub fn is_field_check(id: &str) -> bool {
    matches!(
        id,
        "type" | "models" | "tags" | "status" | "date" | "duration" | "cost" | "tokens" | "length"
    )
}

pub struct CheckEngine {
    runner: Arc<EvaluatorRunner>,
}

impl CheckEngine {
    pub fn new(runner: Arc<EvaluatorRunner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &Arc<EvaluatorRunner> {
        &self.runner
    }

    /// Evaluate `logic` against `run`.
    ///
    /// Evaluator failures are returned as errors rather than counted as
    /// failed checks, so the caller can retry the run later.
    pub async fn run_checks(&self, run: &Run, logic: &Value) -> Result<CheckOutcome, EvalError> {
        let mut results = Vec::new();
        let passed = self.eval_node(run, logic, &mut results).await?;
        Ok(CheckOutcome { passed, results })
    }

    fn eval_node<'a: 'b, 'b>(
        &'a self,
        run: &'a Run,
        node: &'a Value,
        results: &'b mut Vec<CheckResult>,
    ) -> BoxFuture<'b, Result<bool, EvalError>> {
        Box::pin(async move {
            match node {
                Value::Array(items) => {
                    let (is_or, rest) = match items.first() {
                        Some(Value::String(op)) => (op == "OR", &items[1..]),
                        _ => (false, &items[..]),
                    };
                    if rest.is_empty() {
                        return Ok(true);
                    }
                    for item in rest {
                        let passed = self.eval_node(run, item, &mut *results).await?;
                        if passed == is_or {
                            return Ok(is_or);
                        }
                    }
                    Ok(!is_or)
                }
                Value::Object(_) => {
                    let result = self.eval_check(run, node).await?;
                    let passed = result.passed;
                    results.push(result);
                    Ok(passed)
                }
                Value::Null => Ok(true),
                Value::Bool(decided) => Ok(*decided),
                other => Err(EvalError::InvalidInput(format!(
                    "invalid check element: {}",
                    other
                ))),
            }
        })
    }

    async fn eval_check(&self, run: &Run, check: &Value) -> Result<CheckResult, EvalError> {
        let id = check
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| EvalError::MissingField("check.id".into()))?;
        let params = check.get("params").unwrap_or(&Value::Null);

        if is_field_check(id) {
            return Ok(CheckResult {
                id: id.to_string(),
                passed: field_check(id, run, params)?,
                reason: None,
                details: None,
            });
        }

        if !self.runner.registry().contains(id) {
            warn!("Unknown check id: {}", id);
            return Ok(CheckResult {
                id: id.to_string(),
                passed: false,
                reason: Some(format!("unknown check: {}", id)),
                details: None,
            });
        }

        let verdict = self.runner.try_evaluate(id, run, params).await?;
        Ok(CheckResult {
            id: id.to_string(),
            passed: verdict.passed,
            reason: verdict.reason,
            details: verdict.details,
        })
    }
}

fn compare(params: &Value, value: f64, target: f64) -> Result<bool, EvalError> {
    match str_param(params, "operator") {
        Some("gt") => Ok(value > target),
        Some("gte") => Ok(value >= target),
        Some("lt") => Ok(value < target),
        Some("lte") => Ok(value <= target),
        Some("eq") => Ok(value == target),
        Some("neq") => Ok(value != target),
        other => Err(EvalError::InvalidInput(format!(
            "unsupported operator: {:?}",
            other
        ))),
    }
}

fn require_num(params: &Value, key: &str) -> Result<f64, EvalError> {
    num_param(params, key).ok_or_else(|| EvalError::MissingField(format!("params.{}", key)))
}

fn string_list(params: &Value, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// A comparison against a missing value fails, as it would in SQL.
fn field_check(id: &str, run: &Run, params: &Value) -> Result<bool, EvalError> {
    let missing = |key: &str| EvalError::MissingField(format!("params.{}", key));
    match id {
        "type" => {
            let wanted = str_param(params, "type").ok_or_else(|| missing("type"))?;
            if wanted == "trace" {
                return Ok(matches!(run.run_type, RunType::Agent | RunType::Chain)
                    && run.parent_run_id.is_none());
            }
            Ok(RunType::from_str(wanted).map_or(false, |t| t == run.run_type))
        }
        "models" => {
            let names = string_list(params, "names");
            Ok(run.name.as_ref().map_or(false, |name| names.contains(name)))
        }
        "tags" => {
            let tags = string_list(params, "tags");
            Ok(run.tags.iter().any(|tag| tags.contains(tag)))
        }
        "status" => {
            let wanted = str_param(params, "status").ok_or_else(|| missing("status"))?;
            Ok(run.status.map_or(false, |status| status.as_str() == wanted))
        }
        "date" => {
            let raw = str_param(params, "date").ok_or_else(|| missing("date"))?;
            let date = parse_date(raw)
                .ok_or_else(|| EvalError::InvalidInput(format!("invalid date: {}", raw)))?;
            compare(
                params,
                run.created_at.timestamp_millis() as f64,
                date.timestamp_millis() as f64,
            )
        }
        "duration" => {
            let target = require_num(params, "duration")?;
            match run.duration_ms() {
                Some(ms) => compare(params, ms as f64 / 1000.0, target),
                None => Ok(false),
            }
        }
        "cost" => {
            let target = require_num(params, "cost")?;
            match run.cost {
                Some(cost) => compare(params, cost, target),
                None => Ok(false),
            }
        }
        "tokens" => {
            let target = require_num(params, "tokens")?;
            let tokens = match str_param(params, "field") {
                Some("prompt") => run.prompt_tokens,
                Some("completion") => run.completion_tokens,
                _ => run.total_tokens(),
            };
            match tokens {
                Some(tokens) => compare(params, tokens as f64, target),
                None => Ok(false),
            }
        }
        "length" => {
            let target = require_num(params, "length")?;
            let field = str_param(params, "field").unwrap_or("output");
            match last_message(run_field(run, field)) {
                Some(text) => compare(params, text.chars().count() as f64, target),
                None => Ok(false),
            }
        }
        other => Err(EvalError::UnknownEvaluator(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EvaluatorRegistry;
    use crate::test_support::run_with;
    use crate::EvalConfig;
    use runlens_core::RunStatus;
    use chrono::Duration;
    use serde_json::json;

    fn engine() -> CheckEngine {
        let registry = Arc::new(EvaluatorRegistry::with_defaults(None));
        CheckEngine::new(Arc::new(EvaluatorRunner::new(registry, EvalConfig::default())))
    }

    fn priced_run() -> Run {
        let mut run = run_with(json!("What is 2+2?"), json!("The answer is 4"));
        run.name = Some("gpt-4".into());
        run.cost = Some(0.06);
        run.prompt_tokens = Some(1000);
        run.completion_tokens = Some(500);
        run.tags = vec!["prod".into()];
        run.status = Some(RunStatus::Success);
        run.ended_at = Some(run.created_at + Duration::milliseconds(2500));
        run
    }

    #[tokio::test]
    async fn test_field_checks() {
        let engine = engine();
        let run = priced_run();
        let cases = [
            (json!({"id": "type", "params": {"type": "llm"}}), true),
            (json!({"id": "type", "params": {"type": "trace"}}), false),
            (json!({"id": "models", "params": {"names": ["gpt-4", "gpt-4o"]}}), true),
            (json!({"id": "tags", "params": {"tags": ["staging"]}}), false),
            (json!({"id": "status", "params": {"status": "success"}}), true),
            (json!({"id": "cost", "params": {"operator": "gte", "cost": 0.06}}), true),
            (json!({"id": "tokens", "params": {"operator": "gt", "tokens": 1400}}), true),
            (json!({"id": "tokens", "params": {"field": "prompt", "operator": "lt", "tokens": 1000}}), false),
            (json!({"id": "duration", "params": {"operator": "gt", "duration": 2}}), true),
            (json!({"id": "length", "params": {"field": "output", "operator": "eq", "length": 15}}), true),
            (json!({"id": "date", "params": {"operator": "gt", "date": "2024-01-01"}}), true),
        ];
        for (check, expected) in cases {
            let outcome = engine
                .run_checks(&run, &json!(["AND", check.clone()]))
                .await
                .unwrap();
            assert_eq!(outcome.passed, expected, "{}", check);
        }
    }

    #[tokio::test]
    async fn test_missing_cost_fails_comparison() {
        let engine = engine();
        let mut run = priced_run();
        run.cost = None;
        let logic = json!(["AND", {"id": "cost", "params": {"operator": "lt", "cost": 1}}]);
        assert!(!engine.run_checks(&run, &logic).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_or_short_circuits() {
        let engine = engine();
        let run = priced_run();
        // The assertion would fail without an LLM client; OR stops before it
        let logic = json!([
            "OR",
            {"id": "type", "params": {"type": "llm"}},
            {"id": "assertion", "params": {"assertion": "polite"}}
        ]);
        let outcome = engine.run_checks(&run, &logic).await.unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.results.len(), 1);
    }

    #[tokio::test]
    async fn test_and_short_circuits_and_nests() {
        let engine = engine();
        let run = priced_run();
        let logic = json!([
            "AND",
            {"id": "regex", "params": {"regex": "\\d", "type": "contains", "field": "output"}},
            ["OR",
                {"id": "tags", "params": {"tags": ["staging"]}},
                {"id": "models", "params": {"names": ["gpt-4"]}}
            ],
            {"id": "status", "params": {"status": "error"}},
            {"id": "assertion", "params": {"assertion": "never evaluated"}}
        ]);
        let outcome = engine.run_checks(&run, &logic).await.unwrap();
        assert!(!outcome.passed);
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["regex", "tags", "models", "status"]);
        assert_eq!(outcome.results[0].details, Some(json!({"match": "4"})));
    }

    #[tokio::test]
    async fn test_unknown_checks_fail_and_errors_propagate() {
        let engine = engine();
        let run = priced_run();
        let unknown = json!(["AND", {"id": "users", "params": {"users": ["u1"]}}]);
        let outcome = engine.run_checks(&run, &unknown).await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.results[0].reason.as_deref(), Some("unknown check: users"));

        let failing = json!(["AND", {"id": "assertion", "params": {"assertion": "x"}}]);
        assert!(engine.run_checks(&run, &failing).await.is_err());
    }

    #[tokio::test]
    async fn test_decided_elements_count_as_verdicts() {
        let engine = engine();
        let run = priced_run();
        let logic = json!(["AND", true, ["OR", false, {"id": "type", "params": {"type": "llm"}}]]);
        let outcome = engine.run_checks(&run, &logic).await.unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.results.len(), 1);
        assert!(!engine.run_checks(&run, &json!(["OR", false])).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_empty_trees_match() {
        let engine = engine();
        let run = priced_run();
        for logic in [json!(["AND"]), json!([]), json!(["OR"]), Value::Null] {
            assert!(engine.run_checks(&run, &logic).await.unwrap().passed);
        }
    }
}
