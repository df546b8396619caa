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

//! Similarity between a run's output and its ideal output

use crate::evaluators::{ideal_output, num_param, require_llm, str_param};
use crate::llm_client::LLMClient;
use crate::text::last_message;
use crate::{EvalError, Evaluator, EvaluatorMetadata, Verdict};
use async_trait::async_trait;
use runlens_core::Run;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Jaccard index over whitespace-separated words, scaled to 1..=100.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 100.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    1.0 + (intersection as f64 / union as f64) * 99.0
}

/// Cosine similarity of lowercase word-count vectors, scaled to 0..=100.
pub fn cosine_similarity(a: &str, b: &str) -> f64 {
    fn counts(text: &str) -> HashMap<String, f64> {
        let mut counts = HashMap::new();
        for word in text.split_whitespace() {
            *counts.entry(word.to_lowercase()).or_insert(0.0) += 1.0;
        }
        counts
    }

    let (va, vb) = (counts(a), counts(b));
    let dot: f64 = va
        .iter()
        .filter_map(|(word, x)| vb.get(word).map(|y| x * y))
        .sum();
    let norm = |v: &HashMap<String, f64>| v.values().map(|x| x * x).sum::<f64>().sqrt();
    let denominator = norm(&va) * norm(&vb);
    if denominator == 0.0 {
        return 0.0;
    }
    dot / denominator * 100.0
}

/// Compares the last output message with `idealOutput`
///
/// `algorithm` is `jaccard` (default), `cosine`, or `ai` for an LLM-rated
/// distance. The run passes when the similarity reaches `percent`.
pub struct SimilarityEvaluator {
    llm_client: Option<Arc<dyn LLMClient>>,
}

impl SimilarityEvaluator {
    pub fn new(llm_client: Option<Arc<dyn LLMClient>>) -> Self {
        Self { llm_client }
    }

    async fn ai_similarity(&self, text: &str, ideal: &str) -> Result<f64, EvalError> {
        let llm = require_llm(&self.llm_client)?;
        let prompt = format!(
            r#"Rate how similar the meaning of these two texts is, from 1 (unrelated) to 100 (same meaning).

TEXT 1:
{text}

TEXT 2:
{ideal}

Respond ONLY with valid JSON:
{{
  "similarity": <1-100>
}}"#
        );
        let response = llm.evaluate(prompt).await?;
        response
            .get("similarity")
            .and_then(|v| v.as_f64())
            .map(|s| s.clamp(1.0, 100.0))
            .ok_or_else(|| EvalError::LLMClientError("No similarity in judge response".into()))
    }
}

#[async_trait]
impl Evaluator for SimilarityEvaluator {
    fn id(&self) -> &str {
        "similarity"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let ideal = ideal_output(run, params)
            .ok_or_else(|| EvalError::MissingField("idealOutput".into()))?;
        let output = last_message(run.output.as_ref()).unwrap_or_default();
        let percent = num_param(params, "percent").unwrap_or(50.0);

        let similarity = match str_param(params, "algorithm").unwrap_or("jaccard") {
            "jaccard" => jaccard_similarity(&output, &ideal),
            "cosine" => cosine_similarity(&output, &ideal),
            "ai" => self.ai_similarity(&output, &ideal).await?,
            other => {
                return Err(EvalError::InvalidInput(format!(
                    "unknown similarity algorithm: {}",
                    other
                )))
            }
        };

        Ok(Verdict::new(similarity >= percent)
            .with_score(similarity)
            .with_details(json!({ "similarity": similarity })))
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "Similarity",
            "Compares the response with an ideal output",
            &["reference"],
        )
    }

    fn is_remote(&self) -> bool {
        self.llm_client.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::tests::ScriptedClient;
    use crate::test_support::run_with;

    #[test]
    fn test_jaccard_scale() {
        assert_eq!(jaccard_similarity("a b c", "a b c"), 100.0);
        assert_eq!(jaccard_similarity("a b", "c d"), 1.0);
        // {a, b} ∩ {a, c} = 1 of 3
        assert!((jaccard_similarity("a b", "a c") - 34.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity("The cat", "the CAT") - 100.0).abs() < 1e-9);
        assert_eq!(cosine_similarity("cat", "dog"), 0.0);
        assert_eq!(cosine_similarity("", "dog"), 0.0);
    }

    #[tokio::test]
    async fn test_similarity_against_metadata_ideal_output() {
        let evaluator = SimilarityEvaluator::new(None);
        let mut run = run_with(json!("q"), json!("Paris is the capital of France"));
        run.metadata = Some(json!({"idealOutput": "Paris is the capital of France"}));

        let verdict = evaluator
            .evaluate(&run, &json!({"algorithm": "jaccard", "percent": 90}))
            .await
            .unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.score, Some(100.0));
    }

    #[tokio::test]
    async fn test_missing_ideal_output() {
        let evaluator = SimilarityEvaluator::new(None);
        let run = run_with(json!("q"), json!("a"));
        assert!(matches!(
            evaluator.evaluate(&run, &json!({"percent": 10})).await,
            Err(EvalError::MissingField(_))
        ));
    }

    #[tokio::test]
    async fn test_ai_similarity() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(r#"{"similarity": 72}"#)]));
        let evaluator = SimilarityEvaluator::new(Some(client));
        let run = run_with(json!("q"), json!("The capital is Paris"));

        let verdict = evaluator
            .evaluate(
                &run,
                &json!({"algorithm": "ai", "percent": "70", "idealOutput": "Paris"}),
            )
            .await
            .unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.score, Some(72.0));
    }
}
