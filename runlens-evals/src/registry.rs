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

//! Evaluator registry keyed by check id

use crate::evaluators::{
    AssertionEvaluator, EntitiesEvaluator, FactualnessEvaluator, JsonEvaluator, JudgeEvaluator,
    PiiEvaluator, RegexEvaluator, RougeEvaluator, SentimentEvaluator, SimilarityEvaluator,
    StringEvaluator, SummarizationEvaluator, ToneEvaluator, ToxicityEvaluator,
};
use crate::llm_client::LLMClient;
use crate::model::{LazyModel, SentimentModelLoader, ToxicityModelLoader};
use crate::{EvalError, Evaluator, EvaluatorMetadata};
use dashmap::DashMap;
use std::sync::Arc;

/// Evaluators available to checks, looked up by id
pub struct EvaluatorRegistry {
    evaluators: DashMap<String, Arc<dyn Evaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self {
            evaluators: DashMap::new(),
        }
    }

    /// Registry with every built-in evaluator.
    ///
    /// LLM-judged evaluators are registered even without a client and fail
    /// with an error when called, so a check naming them is never silently
    /// skipped.
    pub fn with_defaults(llm_client: Option<Arc<dyn LLMClient>>) -> Self {
        let sentiment_model = Arc::new(LazyModel::new(Arc::new(SentimentModelLoader)));
        let toxicity_model = Arc::new(LazyModel::new(Arc::new(ToxicityModelLoader)));

        let registry = Self::new();
        registry.register(Arc::new(RegexEvaluator::new()));
        registry.register(Arc::new(JsonEvaluator::new()));
        registry.register(Arc::new(StringEvaluator::new()));
        registry.register(Arc::new(RougeEvaluator::new()));
        registry.register(Arc::new(PiiEvaluator::new()));
        registry.register(Arc::new(SentimentEvaluator::new(sentiment_model)));
        registry.register(Arc::new(ToxicityEvaluator::new(toxicity_model)));
        registry.register(Arc::new(AssertionEvaluator::new(llm_client.clone())));
        registry.register(Arc::new(ToneEvaluator::new(llm_client.clone())));
        registry.register(Arc::new(FactualnessEvaluator::new(llm_client.clone())));
        registry.register(Arc::new(EntitiesEvaluator::new(llm_client.clone())));
        registry.register(Arc::new(JudgeEvaluator::new(llm_client.clone())));
        registry.register(Arc::new(SummarizationEvaluator::new(llm_client.clone())));
        registry.register(Arc::new(SimilarityEvaluator::new(llm_client)));
        registry
    }

    /// Add an evaluator, replacing any registered under the same id.
    pub fn register(&self, evaluator: Arc<dyn Evaluator>) {
        self.evaluators
            .insert(evaluator.id().to_string(), evaluator);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Evaluator>> {
        self.evaluators.get(id).map(|e| e.value().clone())
    }

    pub fn require(&self, id: &str) -> Result<Arc<dyn Evaluator>, EvalError> {
        self.get(id)
            .ok_or_else(|| EvalError::UnknownEvaluator(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.evaluators.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.evaluators.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn metadata(&self) -> Vec<(String, EvaluatorMetadata)> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.get(&id).map(|e| (id, e.metadata())))
            .collect()
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
