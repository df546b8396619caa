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

//! Summarization quality judged by an LLM

use crate::evaluators::{num_param, require_llm};
use crate::llm_client::LLMClient;
use crate::text::last_message;
use crate::{EvalError, Evaluator, EvaluatorMetadata, Verdict};
use async_trait::async_trait;
use runlens_core::Run;
use serde_json::{json, Value};
use std::sync::Arc;

/// Scores how well the last output message summarizes the input
///
/// The judge rates coverage and faithfulness on a 1-5 scale each; the
/// verdict score is their mean mapped to `[0, 1]`. Passes at `threshold`
/// (default 0.6).
pub struct SummarizationEvaluator {
    llm_client: Option<Arc<dyn LLMClient>>,
}

impl SummarizationEvaluator {
    pub fn new(llm_client: Option<Arc<dyn LLMClient>>) -> Self {
        Self { llm_client }
    }
}

fn rating(json: &Value, key: &str) -> Result<f64, EvalError> {
    json[key]
        .as_f64()
        .map(|r| r.clamp(1.0, 5.0))
        .ok_or_else(|| EvalError::LLMClientError(format!("Judge response missing '{}'", key)))
}

#[async_trait]
impl Evaluator for SummarizationEvaluator {
    fn id(&self) -> &str {
        "summarization"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let llm = require_llm(&self.llm_client)?;
        let source = last_message(run.input.as_ref())
            .ok_or_else(|| EvalError::MissingField("input".into()))?;
        let summary = last_message(run.output.as_ref())
            .ok_or_else(|| EvalError::MissingField("output".into()))?;
        let threshold = num_param(params, "threshold").unwrap_or(0.6);

        let prompt = format!(
            r#"You are evaluating a summary of a source text.

SOURCE:
{source}

SUMMARY:
{summary}

Rate the summary on two criteria, each from 1 (poor) to 5 (excellent):
- coverage: the summary keeps the key points of the source
- faithfulness: the summary states nothing the source does not support

Respond ONLY with valid JSON:
{{
  "coverage": <1-5>,
  "faithfulness": <1-5>,
  "reason": "<brief explanation>"
}}"#
        );

        let response = llm.evaluate(prompt).await?;
        let json = response.as_json().map_err(|e| {
            EvalError::LLMClientError(format!("Failed to parse summarization response: {}", e))
        })?;

        let coverage = rating(&json, "coverage")?;
        let faithfulness = rating(&json, "faithfulness")?;
        let score = ((coverage + faithfulness) / 2.0 - 1.0) / 4.0;

        Ok(Verdict::new(score >= threshold)
            .with_score(score)
            .with_reason(json["reason"].as_str().unwrap_or_default())
            .with_details(json!({
                "coverage": coverage,
                "faithfulness": faithfulness,
            })))
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "Summarization",
            "LLM judge rating summary coverage and faithfulness",
            &["llm-judge", "quality"],
        )
    }

    fn is_remote(&self) -> bool {
        true
    }
}
