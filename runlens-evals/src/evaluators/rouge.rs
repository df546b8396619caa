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

//! ROUGE overlap between the output and the run's retrieved context

use std::collections::HashMap;

use async_trait::async_trait;
use runlens_core::Run;
use serde_json::{json, Value};

use crate::evaluators::{num_param, str_param};
use crate::text::{last_message, run_field};
use crate::{EvalError, Evaluator, EvaluatorMetadata, Verdict};

/// ROUGE score components
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RougeScore {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl RougeScore {
    fn from_overlap(overlap: usize, candidate: usize, reference: usize) -> Self {
        if candidate == 0 || reference == 0 {
            return Self::default();
        }
        let precision = overlap as f64 / candidate as f64;
        let recall = overlap as f64 / reference as f64;
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1,
        }
    }
}

/// Which ROUGE variant a check asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RougeVariant {
    /// N-gram overlap
    N(usize),
    /// Longest common subsequence
    L,
    /// Skip-bigram overlap
    S,
}

impl RougeVariant {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "n" | "rouge1" | "rouge-1" | "rouge-n" => Some(Self::N(1)),
            "rouge2" | "rouge-2" => Some(Self::N(2)),
            "l" | "rougel" | "rouge-l" => Some(Self::L),
            "s" | "rouges" | "rouge-s" => Some(Self::S),
            _ => None,
        }
    }

    pub fn score(&self, reference: &str, candidate: &str) -> RougeScore {
        match self {
            Self::N(n) => rouge_n(reference, candidate, *n),
            Self::L => rouge_l(reference, candidate),
            Self::S => rouge_s(reference, candidate),
        }
    }
}

/// Lowercased words with surrounding punctuation trimmed
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|s| s.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn counts<T: std::hash::Hash + Eq>(items: impl IntoIterator<Item = T>) -> HashMap<T, usize> {
    let mut counts = HashMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    counts
}

/// Clipped overlap of two multisets
fn clipped_overlap<T: std::hash::Hash + Eq>(a: &HashMap<T, usize>, b: &HashMap<T, usize>) -> usize {
    a.iter()
        .filter_map(|(item, count)| b.get(item).map(|other| (*count).min(*other)))
        .sum()
}

pub fn rouge_n(reference: &str, candidate: &str, n: usize) -> RougeScore {
    let n = n.max(1);
    let ref_tokens = tokenize(reference);
    let cand_tokens = tokenize(candidate);
    if ref_tokens.len() < n || cand_tokens.len() < n {
        return RougeScore::default();
    }
    let ref_grams = counts(ref_tokens.windows(n));
    let cand_grams = counts(cand_tokens.windows(n));
    RougeScore::from_overlap(
        clipped_overlap(&cand_grams, &ref_grams),
        cand_tokens.len() + 1 - n,
        ref_tokens.len() + 1 - n,
    )
}

pub fn rouge_l(reference: &str, candidate: &str) -> RougeScore {
    let ref_tokens = tokenize(reference);
    let cand_tokens = tokenize(candidate);
    RougeScore::from_overlap(
        lcs_length(&ref_tokens, &cand_tokens),
        cand_tokens.len(),
        ref_tokens.len(),
    )
}

/// Skip-bigrams: every ordered pair of words, any distance apart.
pub fn rouge_s(reference: &str, candidate: &str) -> RougeScore {
    let skip_bigrams = |tokens: &[String]| {
        let mut pairs = Vec::new();
        for i in 0..tokens.len() {
            for j in i + 1..tokens.len() {
                pairs.push((tokens[i].clone(), tokens[j].clone()));
            }
        }
        pairs
    };
    let ref_pairs = skip_bigrams(&tokenize(reference));
    let cand_pairs = skip_bigrams(&tokenize(candidate));
    let (ref_len, cand_len) = (ref_pairs.len(), cand_pairs.len());
    RougeScore::from_overlap(
        clipped_overlap(&counts(cand_pairs), &counts(ref_pairs)),
        cand_len,
        ref_len,
    )
}

/// LCS length, O(mn) time and O(min(m, n)) space
fn lcs_length(a: &[String], b: &[String]) -> usize {
    let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
    let mut prev = vec![0usize; short.len() + 1];
    let mut curr = vec![0usize; short.len() + 1];
    for item in long {
        for j in 1..=short.len() {
            curr[j] = if *item == short[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[short.len()]
}

/// Text the output is compared against: `context` from params, else from
/// run metadata.
fn context(run: &Run, params: &Value) -> Option<String> {
    let from = |v: &Value| v.get("context").and_then(|c| last_message(Some(c)));
    from(params).or_else(|| run.metadata.as_ref().and_then(from))
}

/// Passes when the ROUGE F1 of the output against the context, as a
/// percentage, reaches `percent`
#[derive(Default)]
pub struct RougeEvaluator;

impl RougeEvaluator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Evaluator for RougeEvaluator {
    fn id(&self) -> &str {
        "rouge"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let percent = num_param(params, "percent")
            .ok_or_else(|| EvalError::MissingField("params.percent".into()))?;
        let raw_variant = str_param(params, "rouge").unwrap_or("n");
        let variant = RougeVariant::parse(raw_variant).ok_or_else(|| {
            EvalError::InvalidInput(format!("unknown rouge type: {}", raw_variant))
        })?;
        let reference = context(run, params)
            .ok_or_else(|| EvalError::InvalidInput("No context to compare to".into()))?;
        let output = last_message(run_field(run, "output")).unwrap_or_default();

        let score = variant.score(&reference, &output);
        let rouge = score.f1 * 100.0;
        let passed = rouge >= percent;
        let comparison = if passed { ">=" } else { "<" };
        Ok(Verdict::new(passed)
            .with_score(score.f1)
            .with_reason(format!("Rouge score: {:.2} {} {}%", rouge, comparison, percent))
            .with_details(json!({ "rouge": rouge })))
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "ROUGE",
            "N-gram, LCS or skip-bigram overlap between the output and the context",
            &["reference"],
        )
    }
}
