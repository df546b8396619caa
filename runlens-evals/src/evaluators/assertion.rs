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

//! LLM-as-judge checks: assertion, tone, factualness, named entities and
//! custom judge prompts

use crate::evaluators::{ideal_output, num_param, require_llm, require_str, str_param};
use crate::llm_client::LLMClient;
use crate::text::{last_message, run_field};
use crate::{EvalError, Evaluator, EvaluatorMetadata, Verdict};
use async_trait::async_trait;
use runlens_core::Run;
use serde_json::{json, Value};
use std::sync::Arc;

/// Ask the judge whether `assertion` holds for `text`.
async fn judge_assertion(
    llm: &dyn LLMClient,
    text: &str,
    assertion: &str,
) -> Result<Verdict, EvalError> {
    let prompt = format!(
        r#"You are checking an AI assistant's response against an assertion.

RESPONSE:
{text}

ASSERTION:
{assertion}

Decide whether the assertion is true for the response. Judge only what the
response says, not whether it is correct in general.

Respond ONLY with valid JSON:
{{
  "passed": <true|false>,
  "reason": "<one sentence explanation>"
}}"#
    );

    let response = llm.evaluate(prompt).await?;
    let json = response
        .as_json()
        .map_err(|e| EvalError::LLMClientError(format!("Failed to parse judge response: {}", e)))?;

    let passed = json["passed"]
        .as_bool()
        .ok_or_else(|| EvalError::LLMClientError("Judge response missing 'passed'".into()))?;
    let reason = json["reason"].as_str().unwrap_or_default().to_string();

    Ok(Verdict::new(passed)
        .with_reason(reason.clone())
        .with_details(json!({ "reason": reason })))
}

/// Checks a natural-language statement against the last output message
pub struct AssertionEvaluator {
    llm_client: Option<Arc<dyn LLMClient>>,
}

impl AssertionEvaluator {
    pub fn new(llm_client: Option<Arc<dyn LLMClient>>) -> Self {
        Self { llm_client }
    }
}

#[async_trait]
impl Evaluator for AssertionEvaluator {
    fn id(&self) -> &str {
        "assertion"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let llm = require_llm(&self.llm_client)?;
        let assertion = require_str(params, "assertion")?;
        let output = last_message(run.output.as_ref()).unwrap_or_default();
        judge_assertion(llm.as_ref(), &output, assertion).await
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "Assertion",
            "LLM judge deciding whether a statement holds for the response",
            &["llm-judge"],
        )
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Checks that the response is spoken in a given persona's tone
pub struct ToneEvaluator {
    llm_client: Option<Arc<dyn LLMClient>>,
}

impl ToneEvaluator {
    pub fn new(llm_client: Option<Arc<dyn LLMClient>>) -> Self {
        Self { llm_client }
    }
}

#[async_trait]
impl Evaluator for ToneEvaluator {
    fn id(&self) -> &str {
        "tone"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let llm = require_llm(&self.llm_client)?;
        let persona = require_str(params, "persona")?;
        let output = last_message(run.output.as_ref()).unwrap_or_default();
        let assertion = format!("The tone of the response is spoken in a '{}' way.", persona);
        judge_assertion(llm.as_ref(), &output, &assertion).await
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "Tone",
            "LLM judge checking the response tone against a persona",
            &["llm-judge"],
        )
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Grades the output against the ideal output, OpenAI fact-eval style
///
/// The judge picks one of:
/// - `a`: the answer is a subset of the ideal output
/// - `b`: a superset of it
/// - `c`: it contains all the same details
/// - `d`: it disagrees
/// - `e`: it differs, but not in a way that matters factually
///
/// The run passes when the pick is one of `choices` (default `b`, `c`).
pub struct FactualnessEvaluator {
    llm_client: Option<Arc<dyn LLMClient>>,
}

impl FactualnessEvaluator {
    pub fn new(llm_client: Option<Arc<dyn LLMClient>>) -> Self {
        Self { llm_client }
    }
}

#[async_trait]
impl Evaluator for FactualnessEvaluator {
    fn id(&self) -> &str {
        "factualness"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let llm = require_llm(&self.llm_client)?;
        let ideal = ideal_output(run, params)
            .ok_or_else(|| EvalError::InvalidInput("No ideal response to compare to".into()))?;
        let choices: Vec<String> = match params.get("choices") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_ascii_lowercase)
                .collect(),
            _ => vec!["b".into(), "c".into()],
        };
        let input = last_message(run_field(run, "input")).unwrap_or_default();
        let output = last_message(run_field(run, "output")).unwrap_or_default();

        let prompt = format!(
            r#"You are comparing a submitted answer to an expert answer on a given question.

[Question]: {input}
[Expert]: {ideal}
[Submission]: {output}

Compare the factual content of the submitted answer with the expert answer.
Ignore any differences in style, grammar, or punctuation. Pick one option:
(A) The submitted answer is a subset of the expert answer and is fully consistent with it.
(B) The submitted answer is a superset of the expert answer and is fully consistent with it.
(C) The submitted answer contains all the same details as the expert answer.
(D) There is a disagreement between the submitted answer and the expert answer.
(E) The answers differ, but these differences don't matter from the perspective of factuality.

Respond ONLY with valid JSON:
{{
  "result": "<a|b|c|d|e>",
  "reason": "<one sentence explanation>"
}}"#
        );

        let response = llm.evaluate(prompt).await?;
        let json = response.as_json().map_err(|e| {
            EvalError::LLMClientError(format!("Failed to parse judge response: {}", e))
        })?;
        let result = json["result"]
            .as_str()
            .map(|r| r.trim().trim_matches(|c: char| c == '(' || c == ')').to_ascii_lowercase())
            .ok_or_else(|| EvalError::LLMClientError("Judge response missing 'result'".into()))?;
        let reason = json["reason"].as_str().unwrap_or_default();

        Ok(Verdict::new(choices.contains(&result))
            .with_reason(reason)
            .with_details(json!({ "result": result })))
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "Factualness",
            "LLM judge comparing the response to the ideal output",
            &["llm-judge", "reference"],
        )
    }

    fn is_remote(&self) -> bool {
        true
    }
}

const ENTITY_LABELS: [(&str, &str); 3] = [
    ("PER", "Persons"),
    ("ORG", "Organizations"),
    ("LOC", "Locations"),
];

fn entity_label(raw: &str) -> Option<&'static str> {
    match raw.to_ascii_lowercase().as_str() {
        "per" | "person" => Some("PER"),
        "org" | "organization" => Some("ORG"),
        "loc" | "location" => Some("LOC"),
        _ => None,
    }
}

/// Named-entity check over one field
///
/// With `type: contains` the run passes when any of the requested
/// `entities` (`PER`, `ORG`, `LOC`) is found; otherwise it passes when none
/// is.
pub struct EntitiesEvaluator {
    llm_client: Option<Arc<dyn LLMClient>>,
}

impl EntitiesEvaluator {
    pub fn new(llm_client: Option<Arc<dyn LLMClient>>) -> Self {
        Self { llm_client }
    }
}

#[async_trait]
impl Evaluator for EntitiesEvaluator {
    fn id(&self) -> &str {
        "entities"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let llm = require_llm(&self.llm_client)?;
        let field = str_param(params, "field").unwrap_or("output");
        let contains = str_param(params, "type") == Some("contains");
        let wanted: Vec<&str> = match params.get("entities") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(entity_label)
                .collect(),
            _ => ENTITY_LABELS.iter().map(|(key, _)| *key).collect(),
        };
        let text = last_message(run_field(run, field)).unwrap_or_default();

        let prompt = format!(
            r#"Extract the named entities from the text below.

TEXT:
{text}

Respond ONLY with valid JSON listing each entity once under its type:
{{
  "PER": ["<person names>"],
  "ORG": ["<organizations>"],
  "LOC": ["<locations>"]
}}"#
        );
        let response = llm.evaluate(prompt).await?;
        let json = response.as_json().map_err(|e| {
            EvalError::LLMClientError(format!("Failed to parse judge response: {}", e))
        })?;

        let mut found = serde_json::Map::new();
        for (key, _) in ENTITY_LABELS {
            let names: Vec<Value> = json[key]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter(|v| v.as_str().map_or(false, |s| !s.trim().is_empty()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            found.insert(key.to_string(), Value::Array(names));
        }
        let has = |key: &str| {
            found
                .get(key)
                .and_then(Value::as_array)
                .map_or(false, |a| !a.is_empty())
        };

        let passed = if contains {
            wanted.iter().any(|key| has(key))
        } else {
            wanted.iter().all(|key| !has(key))
        };
        let detected: Vec<String> = ENTITY_LABELS
            .iter()
            .filter(|(key, _)| has(key))
            .map(|(key, label)| {
                let names: Vec<&str> = found[*key]
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                format!("{}: {}", label, names.join(", "))
            })
            .collect();
        let reason = if detected.is_empty() {
            "No entities detected".to_string()
        } else {
            format!("Entities detected: {}", detected.join(", "))
        };

        Ok(Verdict::new(passed)
            .with_reason(reason)
            .with_details(Value::Object(found)))
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "Entities",
            "Detects persons, organizations and locations in a field",
            &["llm-judge", "pii"],
        )
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Custom judge prompt scored from 0 to 1
///
/// The prompt may reference `{{input}}` and `{{output}}`; both are replaced
/// with the last message of the matching field. The run passes when the
/// judge's score reaches `threshold` (default 0.5).
pub struct JudgeEvaluator {
    llm_client: Option<Arc<dyn LLMClient>>,
}

impl JudgeEvaluator {
    pub fn new(llm_client: Option<Arc<dyn LLMClient>>) -> Self {
        Self { llm_client }
    }

    fn render(template: &str, run: &Run) -> String {
        let input = last_message(run_field(run, "input")).unwrap_or_default();
        let output = last_message(run_field(run, "output")).unwrap_or_default();
        template
            .replace("{{input}}", &input)
            .replace("{{output}}", &output)
    }
}

#[async_trait]
impl Evaluator for JudgeEvaluator {
    fn id(&self) -> &str {
        "judge"
    }

    async fn evaluate(&self, run: &Run, params: &Value) -> Result<Verdict, EvalError> {
        let llm = require_llm(&self.llm_client)?;
        let template = require_str(params, "prompt")?;
        let threshold = num_param(params, "threshold").unwrap_or(0.5);

        let prompt = format!(
            r#"{}

Respond ONLY with valid JSON:
{{
  "score": <0.0-1.0>,
  "reason": "<brief explanation>"
}}"#,
            Self::render(template, run)
        );

        let response = llm.evaluate(prompt).await?;
        let json = response.as_json().map_err(|e| {
            EvalError::LLMClientError(format!("Failed to parse judge response: {}", e))
        })?;
        let score = json["score"]
            .as_f64()
            .ok_or_else(|| EvalError::LLMClientError("Judge response missing 'score'".into()))?
            .clamp(0.0, 1.0);
        let reason = json["reason"].as_str().unwrap_or_default();

        Ok(Verdict::new(score >= threshold)
            .with_score(score)
            .with_reason(reason)
            .with_details(json!({ "threshold": threshold })))
    }

    fn metadata(&self) -> EvaluatorMetadata {
        EvaluatorMetadata::new(
            "LLM Judge",
            "Custom judge prompt returning a score between 0 and 1",
            &["llm-judge"],
        )
    }

    fn is_remote(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::tests::ScriptedClient;
    use crate::test_support::run_with;

    fn scripted(answers: Vec<Result<&str, &str>>) -> Arc<ScriptedClient> {
        Arc::new(ScriptedClient::new(answers))
    }

    #[tokio::test]
    async fn test_assertion_uses_last_output_message() {
        let client = scripted(vec![Ok(r#"{"passed": true, "reason": "It is polite."}"#)]);
        let evaluator = AssertionEvaluator::new(Some(client.clone()));
        let run = run_with(
            json!("hi"),
            json!([
                {"role": "assistant", "content": "first draft"},
                {"role": "assistant", "content": "Thank you for asking!"}
            ]),
        );

        let verdict = evaluator
            .evaluate(&run, &json!({"assertion": "The response is polite"}))
            .await
            .unwrap();

        assert!(verdict.passed);
        assert_eq!(verdict.reason.as_deref(), Some("It is polite."));
        let prompts = client.prompts.lock();
        assert!(prompts[0].contains("Thank you for asking!"));
        assert!(!prompts[0].contains("first draft"));
    }

    #[tokio::test]
    async fn test_tone_builds_persona_assertion() {
        let client = scripted(vec![Ok(r#"{"passed": false, "reason": "Too casual."}"#)]);
        let evaluator = ToneEvaluator::new(Some(client.clone()));
        let run = run_with(json!("hi"), json!("yo what's up"));

        let verdict = evaluator
            .evaluate(&run, &json!({"persona": "formal"}))
            .await
            .unwrap();

        assert!(!verdict.passed);
        assert!(client.prompts.lock()[0]
            .contains("The tone of the response is spoken in a 'formal' way."));
    }

    #[tokio::test]
    async fn test_judge_failure_is_an_error_not_a_verdict() {
        let client = scripted(vec![Err("upstream 500"), Ok("not json")]);
        let evaluator = AssertionEvaluator::new(Some(client));
        let run = run_with(json!("q"), json!("a"));
        let params = json!({"assertion": "anything"});

        assert!(matches!(
            evaluator.evaluate(&run, &params).await,
            Err(EvalError::LLMClientError(_))
        ));
        assert!(matches!(
            evaluator.evaluate(&run, &params).await,
            Err(EvalError::LLMClientError(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_llm_client() {
        let evaluator = AssertionEvaluator::new(None);
        let run = run_with(json!("q"), json!("a"));
        assert!(matches!(
            evaluator.evaluate(&run, &json!({"assertion": "x"})).await,
            Err(EvalError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_judge_threshold() {
        let client = scripted(vec![
            Ok(r#"{"score": 0.6, "reason": "Mostly relevant."}"#),
            Ok(r#"{"score": 0.6, "reason": "Mostly relevant."}"#),
        ]);
        let evaluator = JudgeEvaluator::new(Some(client.clone()));
        let run = run_with(json!("What is Rust?"), json!("A systems language."));

        let lenient = evaluator
            .evaluate(&run, &json!({"prompt": "Is {{output}} an answer to {{input}}?"}))
            .await
            .unwrap();
        assert!(lenient.passed);
        assert_eq!(lenient.score, Some(0.6));

        let strict = evaluator
            .evaluate(
                &run,
                &json!({"prompt": "Is {{output}} an answer to {{input}}?", "threshold": 0.8}),
            )
            .await
            .unwrap();
        assert!(!strict.passed);
        assert!(client.prompts.lock()[0].contains("Is A systems language. an answer to What is Rust?"));
    }

    #[tokio::test]
    async fn test_factualness_choices_and_ideal_output() {
        let client = scripted(vec![
            Ok(r#"{"result": "B", "reason": "Adds the country."}"#),
            Ok(r#"{"result": "(d)", "reason": "Wrong city."}"#),
        ]);
        let evaluator = FactualnessEvaluator::new(Some(client.clone()));
        let mut run = run_with(json!("Where is the Eiffel Tower?"), json!("Paris, France"));
        run.metadata = Some(json!({"idealOutput": "Paris"}));

        let verdict = evaluator.evaluate(&run, &json!({"choices": ["b", "c"]})).await.unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.details, Some(json!({"result": "b"})));
        assert!(client.prompts.lock()[0].contains("[Expert]: Paris\n"));

        let verdict = evaluator.evaluate(&run, &json!({})).await.unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.reason.as_deref(), Some("Wrong city."));
    }

    #[tokio::test]
    async fn test_factualness_needs_ideal_output() {
        let evaluator = FactualnessEvaluator::new(Some(scripted(vec![])));
        let run = run_with(json!("q"), json!("a"));
        assert!(matches!(
            evaluator.evaluate(&run, &json!({"choices": ["c"]})).await,
            Err(EvalError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_entities_contains_and_absent() {
        let answer = r#"{"PER": ["Ada Lovelace"], "ORG": [], "LOC": ["London"]}"#;
        let client = scripted(vec![Ok(answer), Ok(answer), Ok(answer)]);
        let evaluator = EntitiesEvaluator::new(Some(client));
        let run = run_with(json!("q"), json!("Ada Lovelace lived in London."));

        let verdict = evaluator
            .evaluate(&run, &json!({"field": "output", "type": "contains", "entities": ["PER"]}))
            .await
            .unwrap();
        assert!(verdict.passed);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("Entities detected: Persons: Ada Lovelace, Locations: London")
        );
        assert_eq!(verdict.details.unwrap()["ORG"], json!([]));

        let verdict = evaluator
            .evaluate(&run, &json!({"type": "contains", "entities": ["org"]}))
            .await
            .unwrap();
        assert!(!verdict.passed);

        let verdict = evaluator
            .evaluate(&run, &json!({"type": "notcontains", "entities": ["LOC", "ORG"]}))
            .await
            .unwrap();
        assert!(!verdict.passed);
    }
}
