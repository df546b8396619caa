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

//! # Runlens Evaluation Framework
//!
//! Named checks applied to a run's input and output.
//!
//! ## Features
//!
//! - **Trait-based evaluator system**: each check kind implements [`Evaluator`]
//! - **Local models**: sentiment and toxicity classifiers loaded once, lazily
//! - **LLM-as-judge**: assertion, tone, summarization and custom judge prompts
//! - **Check logic**: `AND` / `OR` trees over evaluators and run fields
//! - **Batch runner**: failures are logged and reported as `None`
//!
//! ## Example
//!
//! ```rust,ignore
//! use runlens_evals::{EvaluatorRegistry, EvaluatorRunner, EvalConfig};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(EvaluatorRegistry::with_defaults(None));
//! let runner = EvaluatorRunner::new(registry, EvalConfig::default());
//! let verdict = runner
//!     .evaluate("sentiment", &run, &serde_json::json!({"field": "output", "sentiment": "positive"}))
//!     .await;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use runlens_core::Run;

pub mod cache;
pub mod checks;
pub mod evaluators;
pub mod llm_client;
pub mod model;
pub mod registry;
pub mod runner;
pub mod text;

pub use cache::{CacheKey, CacheStats, EvalCache};
pub use checks::{is_field_check, CheckEngine, CheckOutcome, CheckResult};
pub use llm_client::{LLMClient, LLMError, LLMResponse, OpenAIClient};
pub use model::{
    Classification, LazyModel, ModelLoader, SentimentModelLoader, TextClassifier,
    ToxicityModelLoader,
};
pub use registry::EvaluatorRegistry;
pub use runner::{EvalRequest, EvaluatorRunner};
pub use text::{last_message, run_field};

/// Core trait that all evaluators must implement
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Check id this evaluator answers to (e.g., "sentiment")
    fn id(&self) -> &str;

    /// Evaluate a single run with kind-specific parameters
    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError>;

    /// Metadata about this evaluator
    fn metadata(&self) -> EvaluatorMetadata;

    /// Whether the evaluator calls out to a remote service
    fn is_remote(&self) -> bool {
        false
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<Value>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self::new(true)
    }

    pub fn new(passed: bool) -> Self {
        Self {
            passed,
            score: None,
            reason: None,
            details: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Metadata about an evaluator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorMetadata {
    /// Human-readable name
    pub name: String,

    /// Version string (e.g., "1.0.0")
    pub version: String,

    /// Description of what this evaluator does
    pub description: String,

    /// Tags for categorization
    pub tags: Vec<String>,
}

impl EvaluatorMetadata {
    pub(crate) fn new(name: &str, description: &str, tags: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: description.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Errors that can occur during evaluation
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("LLM client error: {0}")]
    LLMClientError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown evaluator: {0}")]
    UnknownEvaluator(String),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Evaluation timeout")]
    Timeout,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<LLMError> for EvalError {
    fn from(e: LLMError) -> Self {
        EvalError::LLMClientError(e.to_string())
    }
}

/// Configuration for evaluation execution
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Maximum number of concurrent evaluations in a batch
    pub max_concurrent: usize,

    /// Timeout per evaluation in seconds
    pub timeout_secs: u64,

    /// Whether to cache results
    pub enable_cache: bool,

    /// Cache TTL in seconds
    pub cache_ttl_secs: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            timeout_secs: 30,
            enable_cache: true,
            cache_ttl_secs: 3600, // 1 hour
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};
    use runlens_core::{Run, RunType};
    use serde_json::Value;
    use uuid::Uuid;

    pub fn run_with(input: Value, output: Value) -> Run {
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let mut run = Run::new(Uuid::new_v4(), Uuid::new_v4(), RunType::Llm, created);
        run.input = Some(input);
        run.output = Some(output);
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_verdict_serialization_skips_empty() {
        let verdict = Verdict::new(false).with_reason("too short");
        assert_eq!(
            serde_json::to_value(&verdict).unwrap(),
            json!({"passed": false, "reason": "too short"})
        );
    }

    #[test]
    fn test_eval_config_default() {
        let config = EvalConfig::default();
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.timeout_secs, 30);
        assert!(config.enable_cache);
    }
}
