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

//! Evaluator runner
//!
//! Resolves evaluators by id and applies them to runs with a per-call
//! timeout. [`EvaluatorRunner::evaluate`] never fails: an evaluator error is
//! logged and reported as `None`, so one failing check does not abort a batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use runlens_core::Run;

use crate::cache::{CacheKey, EvalCache};
use crate::registry::EvaluatorRegistry;
use crate::{EvalConfig, EvalError, Verdict};

/// One evaluator applied to one run
#[derive(Debug, Clone)]
pub struct EvalRequest {
    pub evaluator_id: String,
    pub run: Arc<Run>,
    pub params: Value,
}

impl EvalRequest {
    pub fn new(evaluator_id: impl Into<String>, run: Arc<Run>, params: Value) -> Self {
        Self {
            evaluator_id: evaluator_id.into(),
            run,
            params,
        }
    }
}

pub struct EvaluatorRunner {
    registry: Arc<EvaluatorRegistry>,
    config: EvalConfig,
    cache: Option<EvalCache>,
}

impl EvaluatorRunner {
    pub fn new(registry: Arc<EvaluatorRegistry>, config: EvalConfig) -> Self {
        let cache = config
            .enable_cache
            .then(|| EvalCache::new(config.cache_ttl_secs));
        Self {
            registry,
            config,
            cache,
        }
    }

    pub fn registry(&self) -> &Arc<EvaluatorRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> Option<&EvalCache> {
        self.cache.as_ref()
    }

    /// Run one evaluator, reporting failures as errors.
    pub async fn try_evaluate(
        &self,
        evaluator_id: &str,
        run: &Run,
        params: &Value,
    ) -> Result<Verdict, EvalError> {
        let evaluator = self.registry.require(evaluator_id)?;

        let key = self
            .cache
            .as_ref()
            .map(|_| CacheKey::new(evaluator_id, run, params));
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(verdict) = cache.get(key).await {
                debug!("Cache hit for {} on run {}", evaluator_id, run.id);
                return Ok(verdict);
            }
        }

        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let verdict = tokio::time::timeout(timeout, evaluator.evaluate(run, params))
            .await
            .map_err(|_| EvalError::Timeout)??;
        debug!(
            "Evaluator {} on run {}: passed={} in {:?}",
            evaluator_id,
            run.id,
            verdict.passed,
            started.elapsed()
        );

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache.set(key, verdict.clone()).await;
        }
        Ok(verdict)
    }

    /// Run one evaluator. Failures are logged and yield `None`.
    pub async fn evaluate(&self, evaluator_id: &str, run: &Run, params: &Value) -> Option<Verdict> {
        match self.try_evaluate(evaluator_id, run, params).await {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                warn!("Evaluator {} failed on run {}: {}", evaluator_id, run.id, e);
                None
            }
        }
    }

    /// Run a batch of independent evaluations, at most `max_concurrent` at a
    /// time. Results are in request order.
    pub async fn evaluate_many(&self, requests: Vec<EvalRequest>) -> Vec<Option<Verdict>> {
        let limit = self.config.max_concurrent.max(1);
        stream::iter(requests)
            .map(|request| async move {
                self.evaluate(&request.evaluator_id, &request.run, &request.params)
                    .await
            })
            .buffered(limit)
            .collect()
            .await
    }
}
