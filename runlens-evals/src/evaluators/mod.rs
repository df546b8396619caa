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

//! Built-in evaluators for run checks

pub mod assertion;
pub mod format;
pub mod pii;
pub mod rouge;
pub mod sentiment;
pub mod similarity;
pub mod summarization;
pub mod toxicity;

pub use assertion::{
    AssertionEvaluator, EntitiesEvaluator, FactualnessEvaluator, JudgeEvaluator, ToneEvaluator,
};
pub use format::{JsonEvaluator, RegexEvaluator, StringEvaluator};
pub use pii::{PiiEvaluator, PiiKind};
pub use rouge::{rouge_l, rouge_n, rouge_s, RougeEvaluator, RougeScore, RougeVariant};
pub use sentiment::SentimentEvaluator;
pub use similarity::{jaccard_similarity, SimilarityEvaluator};
pub use summarization::SummarizationEvaluator;
pub use toxicity::ToxicityEvaluator;

use std::sync::Arc;

use serde_json::Value;

use crate::llm_client::LLMClient;
use crate::text::{last_message, run_field};
use crate::EvalError;
use runlens_core::Run;

pub(crate) fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

pub(crate) fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, EvalError> {
    str_param(params, key).ok_or_else(|| EvalError::MissingField(format!("params.{}", key)))
}

/// A numeric param that may also arrive as a string (`"80"`).
pub(crate) fn num_param(params: &Value, key: &str) -> Option<f64> {
    match params.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Texts selected by a `field` param: `input`, `output`, `error` or `any`.
pub(crate) fn field_texts(run: &Run, field: &str) -> Vec<String> {
    let fields: &[&str] = if field == "any" {
        &["input", "output"]
    } else {
        std::slice::from_ref(&field)
    };
    fields
        .iter()
        .filter_map(|f| last_message(run_field(run, f)))
        .collect()
}

pub(crate) fn require_llm(llm: &Option<Arc<dyn LLMClient>>) -> Result<&Arc<dyn LLMClient>, EvalError> {
    llm.as_ref()
        .ok_or_else(|| EvalError::Internal("LLM client not configured".into()))
}

/// The reference answer for comparison checks, from params or run metadata.
pub(crate) fn ideal_output(run: &Run, params: &Value) -> Option<String> {
    let from = |v: &Value| -> Option<String> {
        v.get("idealOutput")
            .or_else(|| v.get("ideal_output"))
            .and_then(|ideal| last_message(Some(ideal)))
    };
    from(params).or_else(|| run.metadata.as_ref().and_then(from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::run_with;
    use serde_json::json;

    #[test]
    fn test_field_texts_any() {
        let run = run_with(json!("question"), json!([{"role": "assistant", "content": "answer"}]));
        assert_eq!(field_texts(&run, "any"), vec!["question", "answer"]);
        assert_eq!(field_texts(&run, "output"), vec!["answer"]);
        assert!(field_texts(&run, "error").is_empty());
    }

    #[test]
    fn test_ideal_output_falls_back_to_metadata() {
        let mut run = run_with(json!("q"), json!("a"));
        run.metadata = Some(json!({"idealOutput": "expected"}));
        assert_eq!(ideal_output(&run, &json!({})), Some("expected".into()));
        assert_eq!(
            ideal_output(&run, &json!({"idealOutput": "override"})),
            Some("override".into())
        );
    }

    #[test]
    fn test_num_param_accepts_strings() {
        assert_eq!(num_param(&json!({"percent": "80"}), "percent"), Some(80.0));
        assert_eq!(num_param(&json!({"percent": 75}), "percent"), Some(75.0));
        assert_eq!(num_param(&json!({}), "percent"), None);
    }
}
