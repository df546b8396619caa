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

//! Sentiment check backed by the local sentiment model

use crate::evaluators::{require_str, str_param};
use crate::model::LazyModel;
use crate::text::{last_message, run_field};
use crate::{EvalError, Evaluator, EvaluatorMetadata, Verdict};
use async_trait::async_trait;
use runlens_core::Run;
use serde_json::{json, Value};
use std::sync::Arc;

/// Score given to text the model is not asked about
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Inputs shorter than this many characters are not classified
pub const MIN_TEXT_CHARS: usize = 10;

const POSITIVE_THRESHOLD: f64 = 0.7;
const NEGATIVE_THRESHOLD: f64 = 0.4;

/// Checks that a field's sentiment is `positive`, `negative` or `neutral`
///
/// The model yields a score in `[0, 1]` where 1 is fully positive. Scores of
/// 0.7 and above count as positive, 0.4 and below as negative, and the
/// closed range between them as neutral. Short texts and low-confidence
/// classifications score 0.5.
pub struct SentimentEvaluator {
    model: Arc<LazyModel>,
    min_confidence: f64,
}

impl SentimentEvaluator {
    pub fn new(model: Arc<LazyModel>) -> Self {
        Self {
            model,
            min_confidence: 0.5,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Sentiment score for `text`, 0 (negative) to 1 (positive).
    pub async fn score(&self, text: &str) -> Result<f64, EvalError> {
        if text.trim().chars().count() < MIN_TEXT_CHARS {
            return Ok(NEUTRAL_SCORE);
        }

        let model = self.model.get().await?;
        let Some(top) = model.classify(text).into_iter().next() else {
            return Ok(NEUTRAL_SCORE);
        };
        if top.score < self.min_confidence {
            return Ok(NEUTRAL_SCORE);
        }

        Ok(match top.label.to_ascii_uppercase().as_str() {
            "POSITIVE" => top.score,
            "NEGATIVE" => 1.0 - top.score,
            _ => NEUTRAL_SCORE,
        })
    }
}

fn matches_sentiment(expected: &str, score: f64) -> bool {
    match expected {
        "positive" => score >= POSITIVE_THRESHOLD,
        "negative" => score <= NEGATIVE_THRESHOLD,
        _ => (NEGATIVE_THRESHOLD..=POSITIVE_THRESHOLD).contains(&score),
    }
}

#[async_trait]
impl Evaluator for SentimentEvaluator {
    fn id(&self) -> &str {
        "sentiment"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let field = str_param(params, "field").unwrap_or("output");
        let expected = require_str(params, "sentiment")?;
        let text = last_message(run_field(run, field)).unwrap_or_default();

        let score = self.score(&text).await?;

        Ok(Verdict::new(matches_sentiment(expected, score))
            .with_score(score)
            .with_reason(format!("Sentiment score: {:.2}", score))
            .with_details(json!({ "sentiment": score })))
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "Sentiment",
            "Local classifier checking the sentiment of a field",
            &["model", "local"],
        )
    }
}
