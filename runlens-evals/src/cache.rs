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

//! Caching layer for evaluation results

use crate::Verdict;
use moka::future::Cache;
use runlens_core::Run;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Cache for evaluation verdicts
pub struct EvalCache {
    cache: Cache<CacheKey, Verdict>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl EvalCache {
    /// Create a new cache with specified TTL in seconds
    pub fn new(ttl_secs: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get cached verdict
    pub async fn get(&self, key: &CacheKey) -> Option<Verdict> {
        match self.cache.get(key).await {
            Some(verdict) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(verdict)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Set cache entry
    pub async fn set(&self, key: CacheKey, verdict: Verdict) {
        self.cache.insert(key, verdict).await;
    }

    /// Invalidate cache entry
    pub async fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
    }

    /// Clear entire cache
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.cache.entry_count(),
        }
    }
}

/// Cache key: one evaluator applied to one version of a run with one set of params
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    run_id: Uuid,
    evaluator_id: String,
    content_hash: u64,
}

impl CacheKey {
    pub fn new(evaluator_id: &str, run: &Run, params: &Value) -> Self {
        Self {
            run_id: run.id,
            evaluator_id: evaluator_id.to_string(),
            content_hash: Self::hash_content(run, params),
        }
    }

    // A run's input and output may be rewritten after the fact (chat
    // reconciliation), so they are part of the key.
    fn hash_content(run: &Run, params: &Value) -> u64 {
        use std::collections::hash_map::DefaultHasher;

        let mut hasher = DefaultHasher::new();
        for value in [run.input.as_ref(), run.output.as_ref(), Some(params)] {
            match value {
                Some(v) => v.to_string().hash(&mut hasher),
                None => 0u8.hash(&mut hasher),
            }
        }
        hasher.finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entry_count: u64,
}
