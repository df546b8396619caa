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

//! Pattern and format checks: regex, JSON and plain substrings

use crate::evaluators::{field_texts, require_str, str_param};
use crate::text::{last_message, run_field};
use crate::{EvalError, Evaluator, EvaluatorMetadata, Verdict};
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use runlens_core::Run;
use serde_json::{json, Value};

/// Checks whether a field's text matches a user-supplied regex
///
/// Compiled patterns are kept so a radar evaluating the same check over
/// many runs compiles each pattern once.
pub struct RegexEvaluator {
    compiled: DashMap<String, Regex>,
}

impl RegexEvaluator {
    pub fn new() -> Self {
        Self {
            compiled: DashMap::new(),
        }
    }

    fn regex(&self, pattern: &str) -> Result<Regex, EvalError> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern)
            .map_err(|e| EvalError::InvalidInput(format!("invalid regex '{}': {}", pattern, e)))?;
        self.compiled.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

impl Default for RegexEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Evaluator for RegexEvaluator {
    fn id(&self) -> &str {
        "regex"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let re = self.regex(require_str(params, "regex")?)?;
        let field = str_param(params, "field").unwrap_or("output");
        let contains = str_param(params, "type") == Some("contains");

        let text = last_message(run_field(run, field)).unwrap_or_default();
        let found = re.find(&text).map(|m| m.as_str().to_string());
        let has = found.is_some();

        Ok(Verdict::new(has == contains).with_details(json!({
            "match": found.unwrap_or_default()
        })))
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "Regex",
            "Checks whether a field matches a regular expression",
            &["format"],
        )
    }
}

/// Checks that a field is valid JSON, is not, or embeds a JSON object
#[derive(Default)]
pub struct JsonEvaluator;

impl JsonEvaluator {
    pub fn new() -> Self {
        Self
    }
}

/// Whether any `{...}` span, shortest first and non-overlapping, parses as JSON.
fn contains_json_object(text: &str) -> bool {
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            return false;
        };
        let end = start + len + 1;
        if serde_json::from_str::<Value>(&rest[start..end]).is_ok() {
            return true;
        }
        rest = &rest[end..];
    }
    false
}

#[async_trait]
impl Evaluator for JsonEvaluator {
    fn id(&self) -> &str {
        "json"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let field = str_param(params, "field").unwrap_or("output");
        let kind = require_str(params, "type")?;
        let text = last_message(run_field(run, field)).unwrap_or_default();

        let verdict = match kind {
            "valid" => match serde_json::from_str::<Value>(&text) {
                Ok(_) => Verdict::new(true),
                Err(e) => Verdict::new(false).with_reason(e.to_string()),
            },
            "invalid" => Verdict::new(serde_json::from_str::<Value>(&text).is_err()),
            "contains" => Verdict::new(contains_json_object(&text)),
            other => {
                return Err(EvalError::InvalidInput(format!(
                    "unknown json check type: {}",
                    other
                )))
            }
        };
        Ok(verdict)
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "JSON",
            "Checks whether a field is or contains valid JSON",
            &["format"],
        )
    }
}

/// Substring match over the input, the output, or both
///
/// Params: `fields` (`input`, `output`, anything else for both), `type`
/// (`contains`, `notcontains`, `starts`, `ends`), `text` and `sensitive`.
/// Matching ignores case unless `sensitive` is `true` or `"true"`.
#[derive(Default)]
pub struct StringEvaluator;

impl StringEvaluator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Evaluator for StringEvaluator {
    fn id(&self) -> &str {
        "string"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let needle = require_str(params, "text")?;
        let sensitive = match params.get("sensitive") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        };
        let field = match str_param(params, "fields") {
            Some(f @ ("input" | "output")) => f,
            _ => "any",
        };
        let fold = |s: &str| if sensitive { s.to_string() } else { s.to_lowercase() };
        let needle = fold(needle);
        let texts: Vec<String> = field_texts(run, field).iter().map(|t| fold(t)).collect();

        let passed = match str_param(params, "type").unwrap_or("contains") {
            "contains" => texts.iter().any(|t| t.contains(&needle)),
            "notcontains" => !texts.iter().any(|t| t.contains(&needle)),
            "starts" => texts.iter().any(|t| t.starts_with(&needle)),
            "ends" => texts.iter().any(|t| t.ends_with(&needle)),
            other => {
                return Err(EvalError::InvalidInput(format!(
                    "unknown string check type: {}",
                    other
                )))
            }
        };
        Ok(Verdict::new(passed))
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "String",
            "Checks whether the input or output contains, starts or ends with a text",
            &["format"],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::run_with;

    #[tokio::test]
    async fn test_regex_contains_and_not() {
        let evaluator = RegexEvaluator::new();
        let run = run_with(json!("q"), json!("Order #4521 shipped"));

        let verdict = evaluator
            .evaluate(&run, &json!({"regex": r"#\d+", "type": "contains", "field": "output"}))
            .await
            .unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.details, Some(json!({"match": "#4521"})));

        let verdict = evaluator
            .evaluate(&run, &json!({"regex": r"#\d+", "type": "not", "field": "output"}))
            .await
            .unwrap();
        assert!(!verdict.passed);
        assert_eq!(evaluator.compiled.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_regex_is_an_error() {
        let evaluator = RegexEvaluator::new();
        let run = run_with(json!("q"), json!("a"));
        assert!(matches!(
            evaluator.evaluate(&run, &json!({"regex": "(unclosed"})).await,
            Err(EvalError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_json_valid_invalid() {
        let evaluator = JsonEvaluator::new();
        let good = run_with(json!("q"), json!(r#"{"answer": 42}"#));
        let bad = run_with(json!("q"), json!("answer: 42"));

        let valid = json!({"field": "output", "type": "valid"});
        assert!(evaluator.evaluate(&good, &valid).await.unwrap().passed);
        let verdict = evaluator.evaluate(&bad, &valid).await.unwrap();
        assert!(!verdict.passed);
        assert!(verdict.reason.is_some());

        let invalid = json!({"field": "output", "type": "invalid"});
        assert!(evaluator.evaluate(&bad, &invalid).await.unwrap().passed);
        assert!(!evaluator.evaluate(&good, &invalid).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_json_contains_embedded_object() {
        let evaluator = JsonEvaluator::new();
        let params = json!({"field": "output", "type": "contains"});

        let run = run_with(json!("q"), json!("Here you go:\n{\"city\":\n \"Paris\"}\nanything else?"));
        assert!(evaluator.evaluate(&run, &params).await.unwrap().passed);

        let run = run_with(json!("q"), json!("use {braces} for templates"));
        assert!(!evaluator.evaluate(&run, &params).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_string_contains_respects_case_and_fields() {
        let evaluator = StringEvaluator::new();
        let run = run_with(
            json!([{"role": "user", "content": "Where is my Order?"}]),
            json!({"role": "assistant", "content": "Your order ships Monday."}),
        );

        let cases = [
            (json!({"text": "order", "type": "contains"}), true),
            (json!({"text": "order", "type": "contains", "fields": "input", "sensitive": "true"}), false),
            (json!({"text": "Order", "type": "contains", "fields": "input", "sensitive": true}), true),
            (json!({"text": "refund", "type": "notcontains"}), true),
            (json!({"text": "monday", "type": "notcontains", "fields": "output"}), false),
            (json!({"text": "your order", "type": "starts", "fields": "output"}), true),
            (json!({"text": "monday.", "type": "ends"}), true),
        ];
        for (params, expected) in cases {
            let verdict = evaluator.evaluate(&run, &params).await.unwrap();
            assert_eq!(verdict.passed, expected, "{}", params);
        }
    }

    #[tokio::test]
    async fn test_string_requires_text() {
        let evaluator = StringEvaluator::new();
        let run = run_with(json!("q"), json!("a"));
        assert!(matches!(
            evaluator.evaluate(&run, &json!({"type": "contains"})).await,
            Err(EvalError::MissingField(_))
        ));
    }
}
