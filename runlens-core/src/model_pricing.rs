// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Model Pricing Registry
//!
//! Resolves the price of a model name and turns a run's usage into a cost.
//! Resolution order:
//! - persisted model mappings (regex patterns, optionally project-scoped)
//!   whose `start_date` is not after the run's creation: project-scoped
//!   before global, then the longest mapping name, then the newest
//!   `start_date`
//! - custom overrides loaded from TOML
//! - the built-in table, matched by substring so Azure deployment names
//!   such as `my-gpt-4-deployment` still resolve
//!
//! Unknown models price as `None`, never as zero.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::run::{Run, RunType};

/// Runs faster than this were served from a provider-side cache.
pub const CACHED_CALL_THRESHOLD_MS: i64 = 10;

/// Decimal places kept on computed costs
pub const COST_DECIMALS: i32 = 10;

/// Unit a price is expressed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PricingUnit {
    #[default]
    Tokens,
    Characters,
    Milliseconds,
}

impl PricingUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingUnit::Tokens => "TOKENS",
            PricingUnit::Characters => "CHARACTERS",
            PricingUnit::Milliseconds => "MILLISECONDS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TOKENS" => Some(PricingUnit::Tokens),
            "CHARACTERS" => Some(PricingUnit::Characters),
            "MILLISECONDS" => Some(PricingUnit::Milliseconds),
            _ => None,
        }
    }
}

/// Priority level for pricing data
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum PricingPriority {
    /// Built into the application (lowest priority)
    #[default]
    Builtin = 0,
    /// User-defined custom pricing from TOML
    Custom = 1,
    /// Persisted model mapping (highest priority)
    Mapping = 2,
}

/// Model pricing information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Cost per input unit in USD
    pub input_cost_per_unit: f64,
    /// Cost per output unit in USD
    pub output_cost_per_unit: f64,
    #[serde(default)]
    pub unit: PricingUnit,
    /// The provider (e.g., "openai", "anthropic")
    #[serde(default)]
    pub provider: Option<String>,
    /// Source of this pricing data
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub priority: PricingPriority,
    /// Discount per cached prompt token in USD
    #[serde(default)]
    pub cached_input_discount_per_unit: f64,
}

impl ModelPricing {
    pub fn per_1k_tokens(input: f64, output: f64) -> Self {
        Self {
            input_cost_per_unit: input / 1000.0,
            output_cost_per_unit: output / 1000.0,
            ..Default::default()
        }
    }

    /// Calculate the cost for given token counts
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_cost_per_unit)
            + (output_tokens as f64 * self.output_cost_per_unit)
    }

    /// Get cost per 1K input units (for display)
    pub fn input_cost_per_1k(&self) -> f64 {
        self.input_cost_per_unit * 1000.0
    }

    /// Get cost per 1K output units (for display)
    pub fn output_cost_per_1k(&self) -> f64 {
        self.output_cost_per_unit * 1000.0
    }

    /// Price a run according to this pricing's unit. `None` when the usage
    /// the unit needs was not reported.
    pub fn cost_for(&self, run: &CostInput<'_>) -> Option<f64> {
        let raw = match self.unit {
            PricingUnit::Tokens => {
                let prompt = u64::try_from(run.prompt_tokens?).ok()?;
                let completion = u64::try_from(run.completion_tokens?).ok()?;
                let cached = run
                    .cached_prompt_tokens
                    .and_then(|t| u64::try_from(t).ok())
                    .unwrap_or(0);
                let discount = cached as f64 * self.cached_input_discount_per_unit;
                (self.calculate_cost(prompt, completion) - discount).max(0.0)
            }
            PricingUnit::Characters => {
                let input_chars = run.input.map(text_length).unwrap_or(0);
                let output_chars = run.output.map(text_length).unwrap_or(0);
                self.calculate_cost(input_chars, output_chars)
            }
            PricingUnit::Milliseconds => {
                let duration = u64::try_from(run.duration_ms?).ok()?;
                duration as f64 * self.input_cost_per_unit
            }
        };
        Some(round_cost(raw))
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_cost_per_unit: 0.0,
            output_cost_per_unit: 0.0,
            unit: PricingUnit::Tokens,
            provider: None,
            source: None,
            priority: PricingPriority::Builtin,
            cached_input_discount_per_unit: 0.0,
        }
    }
}

/// Round a cost to [`COST_DECIMALS`] places.
pub fn round_cost(value: f64) -> f64 {
    let factor = 10f64.powi(COST_DECIMALS);
    (value * factor).round() / factor
}

fn text_length(value: &Value) -> u64 {
    match value {
        Value::String(s) => s.chars().count() as u64,
        Value::Null => 0,
        other => other.to_string().chars().count() as u64,
    }
}

/// Persisted pricing rule matched against model names by regex.
///
/// Costs are USD per million units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMapping {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub unit: PricingUnit,
    pub input_cost: f64,
    pub output_cost: f64,
    /// `None` applies to every project
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// Runs created before this date do not use the mapping
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub provider: Option<String>,
    /// Reduction per million cached prompt tokens
    #[serde(default)]
    pub input_caching_cost_reduction: f64,
}

impl ModelMapping {
    pub fn to_pricing(&self) -> ModelPricing {
        ModelPricing {
            input_cost_per_unit: self.input_cost / 1_000_000.0,
            output_cost_per_unit: self.output_cost / 1_000_000.0,
            unit: self.unit,
            provider: self.provider.clone(),
            source: Some(format!("mapping:{}", self.name)),
            priority: PricingPriority::Mapping,
            cached_input_discount_per_unit: self.input_caching_cost_reduction / 1_000_000.0,
        }
    }

    /// Whether the mapping was in effect at `at`. Undated mappings always are.
    pub fn applies_at(&self, at: DateTime<Utc>) -> bool {
        self.start_date.map_or(true, |start| start <= at)
    }

    /// Scoped before global, then longest name, then most recent start
    /// date with undated last.
    fn precedence(a: &ModelMapping, b: &ModelMapping) -> Ordering {
        let by_date = match (a.start_date, b.start_date) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        b.project_id
            .is_some()
            .cmp(&a.project_id.is_some())
            .then_with(|| b.name.len().cmp(&a.name.len()))
            .then(by_date)
    }
}

/// The slice of a run the calculator looks at
#[derive(Debug, Clone, Copy)]
pub struct CostInput<'a> {
    pub run_type: RunType,
    pub name: Option<&'a str>,
    pub project_id: Option<Uuid>,
    /// Picks the mappings in effect; `None` means now
    pub created_at: Option<DateTime<Utc>>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub cached_prompt_tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub input: Option<&'a Value>,
    pub output: Option<&'a Value>,
}

impl<'a> From<&'a Run> for CostInput<'a> {
    fn from(run: &'a Run) -> Self {
        Self {
            run_type: run.run_type,
            name: run.name.as_deref(),
            project_id: Some(run.project_id),
            created_at: Some(run.created_at),
            prompt_tokens: run.prompt_tokens,
            completion_tokens: run.completion_tokens,
            cached_prompt_tokens: run.cached_prompt_tokens,
            duration_ms: run.duration_ms(),
            input: run.input.as_ref(),
            output: run.output.as_ref(),
        }
    }
}

/// Custom pricing override (TOML format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPricingOverride {
    pub model_id: String,
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

struct BuiltinPrice {
    models: &'static [&'static str],
    /// USD per 1K tokens
    input: f64,
    /// USD per 1K tokens
    output: f64,
    provider: &'static str,
}

// Matched by substring in order; more specific names come first.
const BUILTIN_PRICES: &[BuiltinPrice] = &[
    BuiltinPrice { models: &["gpt-4o-mini"], input: 0.00015, output: 0.0006, provider: "openai" },
    BuiltinPrice { models: &["gpt-4o"], input: 0.005, output: 0.015, provider: "openai" },
    BuiltinPrice { models: &["ft:gpt-3.5-turbo"], input: 0.003, output: 0.006, provider: "openai" },
    BuiltinPrice {
        models: &["gpt-3.5-turbo-0613", "gpt-3.5-turbo-0301"],
        input: 0.0015,
        output: 0.002,
        provider: "openai",
    },
    BuiltinPrice { models: &["gpt-3.5-turbo-instruct"], input: 0.0015, output: 0.002, provider: "openai" },
    BuiltinPrice { models: &["gpt-3.5-turbo-16k"], input: 0.003, output: 0.004, provider: "openai" },
    BuiltinPrice { models: &["gpt-3.5-turbo-1106"], input: 0.001, output: 0.002, provider: "openai" },
    BuiltinPrice {
        models: &["gpt-3.5-turbo", "gpt-3.5-turbo-0125"],
        input: 0.0005,
        output: 0.0015,
        provider: "openai",
    },
    BuiltinPrice { models: &["text-davinci-003"], input: 0.02, output: 0.02, provider: "openai" },
    BuiltinPrice {
        models: &["gpt-4-turbo", "gpt-4-vision", "gpt-4-1106", "gpt-4-1106-vision", "gpt-4-0125"],
        input: 0.01,
        output: 0.03,
        provider: "openai",
    },
    BuiltinPrice { models: &["gpt-4-32k"], input: 0.06, output: 0.12, provider: "openai" },
    BuiltinPrice {
        models: &["gpt-4", "gpt-4-0613", "gpt-4-0314"],
        input: 0.03,
        output: 0.06,
        provider: "openai",
    },
    BuiltinPrice {
        models: &["claude-instant-1", "claude-instant-v1", "claude-instant-1.2"],
        input: 0.0008,
        output: 0.0024,
        provider: "anthropic",
    },
    BuiltinPrice {
        models: &["claude-2", "claude-v2", "claude-1", "claude-v1", "claude-2.1"],
        input: 0.008,
        output: 0.024,
        provider: "anthropic",
    },
    BuiltinPrice { models: &["claude-3-opus"], input: 0.015, output: 0.075, provider: "anthropic" },
    BuiltinPrice { models: &["claude-3-5-sonnet"], input: 0.003, output: 0.015, provider: "anthropic" },
    BuiltinPrice { models: &["claude-3-sonnet"], input: 0.003, output: 0.075, provider: "anthropic" },
    BuiltinPrice { models: &["claude-3-haiku"], input: 0.00025, output: 0.00125, provider: "anthropic" },
    BuiltinPrice {
        models: &["text-bison", "chat-bison", "code-bison", "codechat-bison"],
        input: 0.0005,
        output: 0.0005,
        provider: "google",
    },
    BuiltinPrice { models: &["command-nightly", "command"], input: 0.015, output: 0.015, provider: "cohere" },
    BuiltinPrice { models: &["mistral-tiny"], input: 0.00014, output: 0.00042, provider: "mistral" },
    BuiltinPrice { models: &["mistral-small"], input: 0.0006, output: 0.0018, provider: "mistral" },
    BuiltinPrice { models: &["mistral-medium"], input: 0.0006, output: 0.0018, provider: "mistral" },
];

/// Thread-safe model pricing registry
#[derive(Clone, Default)]
pub struct ModelPricingRegistry {
    /// Custom overrides (model_id -> pricing)
    custom: Arc<RwLock<HashMap<String, ModelPricing>>>,
    /// Persisted mappings, kept sorted by precedence
    mappings: Arc<RwLock<Vec<ModelMapping>>>,
    /// Compiled mapping patterns; `None` marks an invalid pattern
    regex_cache: Arc<DashMap<String, Option<Regex>>>,
}

impl ModelPricingRegistry {
    /// Create a registry that knows only the built-in table
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the persisted mappings (e.g. after reloading them from storage)
    pub fn set_mappings(&self, mut mappings: Vec<ModelMapping>) {
        mappings.sort_by(ModelMapping::precedence);
        *self.mappings.write() = mappings;
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.read().len()
    }

    /// Add a custom pricing override
    pub fn add_custom_override(&self, override_data: CustomPricingOverride) {
        let pricing = ModelPricing {
            input_cost_per_unit: override_data.input_cost_per_token,
            output_cost_per_unit: override_data.output_cost_per_token,
            unit: PricingUnit::Tokens,
            provider: override_data.provider,
            source: override_data.source.or(Some("Custom".to_string())),
            priority: PricingPriority::Custom,
            cached_input_discount_per_unit: 0.0,
        };
        self.custom
            .write()
            .insert(clean_model_name(&override_data.model_id), pricing);
    }

    /// Load custom overrides from a TOML file of the form
    /// `[models."name"] input_cost_per_token = .. output_cost_per_token = ..`.
    pub fn load_custom_overrides(&self, path: &Path) -> Result<usize, PricingError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PricingError::Io(format!("{}: {}", path.display(), e)))?;

        #[derive(Deserialize)]
        struct CustomOverrideFile {
            models: HashMap<String, CustomModelOverride>,
        }

        #[derive(Deserialize)]
        struct CustomModelOverride {
            input_cost_per_token: f64,
            output_cost_per_token: f64,
            #[serde(default)]
            provider: Option<String>,
            #[serde(default)]
            source: Option<String>,
        }

        let file: CustomOverrideFile =
            toml::from_str(&content).map_err(|e| PricingError::Parse(e.to_string()))?;

        let count = file.models.len();
        for (model_id, o) in file.models {
            if o.input_cost_per_token < 0.0 || o.output_cost_per_token < 0.0 {
                return Err(PricingError::Invalid(format!(
                    "negative price for {}",
                    model_id
                )));
            }
            self.add_custom_override(CustomPricingOverride {
                model_id,
                input_cost_per_token: o.input_cost_per_token,
                output_cost_per_token: o.output_cost_per_token,
                provider: o.provider,
                source: o
                    .source
                    .or(Some(format!("Custom: {:?}", path.file_name()))),
            });
        }
        tracing::info!("Loaded {} custom pricing overrides from {:?}", count, path);
        Ok(count)
    }

    /// Get the pricing in effect now for a model (with fallback resolution)
    pub fn get_pricing(&self, model_id: &str, project_id: Option<Uuid>) -> Option<ModelPricing> {
        self.get_pricing_at(model_id, project_id, Utc::now())
    }

    /// Get the pricing in effect at `at` for a model
    pub fn get_pricing_at(
        &self,
        model_id: &str,
        project_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Option<ModelPricing> {
        if let Some(pricing) = self.match_mapping(model_id, project_id, at) {
            return Some(pricing);
        }

        let cleaned = clean_model_name(model_id);
        {
            let custom = self.custom.read();
            if let Some(pricing) = custom.get(&cleaned) {
                return Some(pricing.clone());
            }
            // Provider-prefixed names (e.g., "openai/gpt-4o" -> "gpt-4o")
            if let Some(stripped) = cleaned.split('/').next_back() {
                if let Some(pricing) = custom.get(stripped) {
                    return Some(pricing.clone());
                }
            }
        }

        BUILTIN_PRICES
            .iter()
            .find(|entry| entry.models.iter().any(|m| cleaned.contains(m)))
            .map(|entry| ModelPricing {
                provider: Some(entry.provider.to_string()),
                source: Some("Builtin".to_string()),
                ..ModelPricing::per_1k_tokens(entry.input, entry.output)
            })
    }

    /// Cost of a run, or `None` when it cannot be priced: not an LLM call,
    /// no model name, a cached call, an unknown model, or missing usage.
    pub fn calculate_cost(&self, run: &CostInput<'_>) -> Option<f64> {
        if run.run_type != RunType::Llm {
            return None;
        }
        let name = run.name.filter(|n| !n.trim().is_empty())?;
        if matches!(run.duration_ms, Some(d) if d > 0 && d < CACHED_CALL_THRESHOLD_MS) {
            return None;
        }
        let at = run.created_at.unwrap_or_else(Utc::now);
        let pricing = self.get_pricing_at(name, run.project_id, at)?;
        pricing.cost_for(run)
    }

    pub fn calculate_run_cost(&self, run: &Run) -> Option<f64> {
        self.calculate_cost(&CostInput::from(run))
    }

    fn match_mapping(
        &self,
        model_id: &str,
        project_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Option<ModelPricing> {
        let mappings = self.mappings.read();
        mappings
            .iter()
            .filter(|m| m.project_id.is_none() || m.project_id == project_id)
            .filter(|m| m.applies_at(at))
            .find(|m| self.pattern_matches(&m.pattern, model_id))
            .map(ModelMapping::to_pricing)
    }

    fn pattern_matches(&self, pattern: &str, model_id: &str) -> bool {
        if let Some(cached) = self.regex_cache.get(pattern) {
            return cached.as_ref().map(|re| re.is_match(model_id)).unwrap_or(false);
        }
        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("Invalid model mapping pattern {}: {}", pattern, e);
                None
            }
        };
        let matched = compiled
            .as_ref()
            .map(|re| re.is_match(model_id))
            .unwrap_or(false);
        self.regex_cache.insert(pattern.to_string(), compiled);
        matched
    }
}

/// Normalize vendor spellings (`gpt4`, `gpt-35`, `claude3`) to the names the
/// built-in table uses.
pub fn clean_model_name(name: &str) -> String {
    name.to_lowercase()
        .replace("gpt4", "gpt-4")
        .replace("gpt3", "gpt-3")
        .replace("gpt-35", "gpt-3.5")
        .replace("claude3", "claude-3")
        .replace("claude2", "claude-2")
        .replace("claude1", "claude-1")
}

/// Errors that can occur in the pricing registry
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum PricingError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid data: {0}")]
    Invalid(String),
}
