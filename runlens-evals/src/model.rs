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

//! Local text classification models
//!
//! Models are loaded on first use and kept for the life of the process.
//! [`LazyModel`] wraps a loader in a one-time initialization cell: callers
//! that arrive while a load is in flight await that same load, and a failed
//! load leaves the cell empty so the next caller retries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::info;

use crate::EvalError;

/// One label scored by a classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub score: f64,
}

/// A loaded text classification model
pub trait TextClassifier: Send + Sync {
    /// Scores for every label the model knows, highest first.
    fn classify(&self, text: &str) -> Vec<Classification>;
}

/// Produces a classifier. Loading may be slow.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Arc<dyn TextClassifier>, EvalError>;
}

/// A classifier loaded at most once, on first use
pub struct LazyModel {
    loader: Arc<dyn ModelLoader>,
    cell: OnceCell<Arc<dyn TextClassifier>>,
    loads: AtomicUsize,
}

impl LazyModel {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            cell: OnceCell::new(),
            loads: AtomicUsize::new(0),
        }
    }

    /// The loaded classifier, loading it if no one has yet.
    pub async fn get(&self) -> Result<Arc<dyn TextClassifier>, EvalError> {
        let model = self
            .cell
            .get_or_try_init(|| async {
                self.loads.fetch_add(1, Ordering::SeqCst);
                let started = Instant::now();
                let model = self.loader.load().await?;
                info!(
                    "Loaded model {} in {:?}",
                    self.loader.name(),
                    started.elapsed()
                );
                Ok::<_, EvalError>(model)
            })
            .await?;
        Ok(model.clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// Number of load attempts started so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "amazing", "awesome", "love", "loved", "like", "happy",
    "glad", "thanks", "thank", "wonderful", "fantastic", "perfect", "helpful", "nice",
    "pleased", "best", "brilliant", "enjoy", "enjoyed", "delighted", "beautiful", "correct",
    "works", "solved", "appreciate", "superb", "kind",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "horrible", "hate", "hated", "sad", "angry", "upset", "worst",
    "poor", "wrong", "broken", "fail", "failed", "failure", "useless", "annoying", "disappointed",
    "disappointing", "problem", "error", "sorry", "unfortunately", "slow", "bug", "crash",
    "frustrated", "ugly", "rude",
];

const NEGATIONS: &[&str] = &["not", "no", "never", "don't", "isn't", "wasn't", "didn't", "can't"];

/// Word-list sentiment model emitting `POSITIVE` / `NEGATIVE` labels
pub struct LexiconSentimentModel {
    positive: HashSet<&'static str>,
    negative: HashSet<&'static str>,
    negations: HashSet<&'static str>,
}

impl LexiconSentimentModel {
    pub fn new() -> Self {
        Self {
            positive: POSITIVE_WORDS.iter().copied().collect(),
            negative: NEGATIVE_WORDS.iter().copied().collect(),
            negations: NEGATIONS.iter().copied().collect(),
        }
    }
}

impl Default for LexiconSentimentModel {
    fn default() -> Self {
        Self::new()
    }
}

impl TextClassifier for LexiconSentimentModel {
    fn classify(&self, text: &str) -> Vec<Classification> {
        let tokens = tokenize(text);
        let (mut pos, mut neg) = (0usize, 0usize);
        for (i, token) in tokens.iter().enumerate() {
            let negated = i > 0 && self.negations.contains(tokens[i - 1].as_str());
            let polarity = if self.positive.contains(token.as_str()) {
                1
            } else if self.negative.contains(token.as_str()) {
                -1
            } else {
                0
            };
            match (polarity, negated) {
                (1, false) | (-1, true) => pos += 1,
                (-1, false) | (1, true) => neg += 1,
                _ => {}
            }
        }

        let total = (pos + neg) as f64;
        let confidence = if total == 0.0 {
            0.5
        } else {
            let polarity = (pos as f64 - neg as f64).abs() / total;
            let strength = total / (total + 1.0);
            0.5 + 0.5 * polarity * strength
        };
        let (top, other) = if pos >= neg {
            ("POSITIVE", "NEGATIVE")
        } else {
            ("NEGATIVE", "POSITIVE")
        };
        vec![
            Classification {
                label: top.to_string(),
                score: confidence,
            },
            Classification {
                label: other.to_string(),
                score: 1.0 - confidence,
            },
        ]
    }
}

/// Phrase-list toxicity model with one score per category
pub struct LexiconToxicityModel {
    categories: HashMap<&'static str, Vec<&'static str>>,
}

impl LexiconToxicityModel {
    pub fn new() -> Self {
        let mut categories = HashMap::new();
        categories.insert(
            "threat",
            vec!["kill you", "hurt you", "i will find you", "you will pay", "destroy you"],
        );
        categories.insert(
            "insult",
            vec!["idiot", "stupid", "moron", "loser", "pathetic", "worthless", "dumb"],
        );
        categories.insert("obscene", vec!["fuck", "shit", "bitch", "cunt", "dick"]);
        categories.insert(
            "identity_hate",
            vec!["go back to your country", "your kind", "subhuman"],
        );
        Self { categories }
    }
}

impl Default for LexiconToxicityModel {
    fn default() -> Self {
        Self::new()
    }
}

impl TextClassifier for LexiconToxicityModel {
    fn classify(&self, text: &str) -> Vec<Classification> {
        let normalized = tokenize(text).join(" ");
        let padded = format!(" {} ", normalized);
        let mut scores: Vec<Classification> = self
            .categories
            .iter()
            .map(|(label, phrases)| {
                let hits = phrases
                    .iter()
                    .filter(|p| padded.contains(&format!(" {} ", p)))
                    .count();
                let score = if hits == 0 {
                    0.02
                } else {
                    (0.6 + 0.25 * hits as f64).min(0.99)
                };
                Classification {
                    label: label.to_string(),
                    score,
                }
            })
            .collect();
        let toxic = scores.iter().map(|c| c.score).fold(0.0_f64, f64::max);
        scores.push(Classification {
            label: "toxic".to_string(),
            score: toxic,
        });
        scores.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.label.cmp(&b.label)));
        scores
    }
}

/// Builds the lexicon sentiment model
pub struct SentimentModelLoader;

#[async_trait]
impl ModelLoader for SentimentModelLoader {
    fn name(&self) -> &str {
        "lexicon-sentiment"
    }

    async fn load(&self) -> Result<Arc<dyn TextClassifier>, EvalError> {
        Ok(Arc::new(LexiconSentimentModel::new()))
    }
}

/// Builds the lexicon toxicity model
pub struct ToxicityModelLoader;

#[async_trait]
impl ModelLoader for ToxicityModelLoader {
    fn name(&self) -> &str {
        "lexicon-toxicity"
    }

    async fn load(&self) -> Result<Arc<dyn TextClassifier>, EvalError> {
        Ok(Arc::new(LexiconToxicityModel::new()))
    }
}
