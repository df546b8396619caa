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

//! Ingestion events reported by client SDKs
//!
//! SDKs in the wild send a loose JSON shape: snake_case and camelCase keys
//! mixed together, arbitrary strings as run ids, tags as a bare string, and
//! legacy field names (`app`, `convoId`, `model`, `history`). [`clean_event`]
//! turns one raw payload into a typed [`Event`] or fails that event alone.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::run::RunType;

/// What an event describes: a run lifecycle step or a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Run(RunType),
    Log,
}

impl EventKind {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "log" {
            return Ok(EventKind::Log);
        }
        s.parse::<RunType>().map(EventKind::Run)
    }

    pub fn run_type(&self) -> Option<RunType> {
        match self {
            EventKind::Run(t) => Some(*t),
            EventKind::Log => None,
        }
    }
}

/// Token counts reported alongside an `end` event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt: Option<i64>,
    #[serde(default)]
    pub completion: Option<i64>,
    /// Prompt tokens served from the provider's prompt cache
    #[serde(default, rename = "cachedPrompt")]
    pub cached_prompt: Option<i64>,
}

/// A cleaned ingestion event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Lifecycle step (`start`, `end`, `error`, `feedback`, `chat`) or log level
    pub event: String,
    /// Project reference carried in the payload (`projectId` or legacy `app`)
    pub project_ref: Option<String>,
    pub run_id: Option<Uuid>,
    pub parent_run_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub name: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub feedback: Option<Value>,
    pub extra: Option<Value>,
    pub params: Option<Value>,
    pub metadata: Option<Value>,
    pub message: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub thread_tags: Option<Vec<String>>,
    pub template_id: Option<i64>,
    pub tokens_usage: Option<TokenUsage>,
    pub runtime: Option<String>,
}

/// Normalize one raw SDK payload.
pub fn clean_event(raw: &Value) -> Result<Event> {
    let camel = camelize(raw);
    let obj = camel
        .as_object()
        .ok_or_else(|| CoreError::InvalidEvent("event must be a JSON object".to_string()))?;

    let type_str = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::InvalidEvent("missing event type".to_string()))?;
    let kind = EventKind::parse(type_str)?;

    let timestamp = parse_timestamp(obj.get("timestamp"))?;

    let metadata = obj.get("metadata").and_then(clean_metadata);

    let run_id = obj
        .get("runId")
        .or_else(|| obj.get("convoId"))
        .and_then(Value::as_str)
        .map(parse_run_id)
        .transpose()?
        .flatten();
    let parent_run_id = obj
        .get("parentRunId")
        .and_then(Value::as_str)
        .map(parse_run_id)
        .transpose()?
        .flatten();

    let name = obj
        .get("name")
        .or_else(|| obj.get("model"))
        .and_then(Value::as_str)
        .map(|n| n.replace("models/", ""));

    let tags = obj
        .get("tags")
        .and_then(string_list)
        .or_else(|| metadata.as_ref().and_then(|m| m.get("tags")).and_then(string_list));

    let template_id = obj
        .get("templateId")
        .and_then(as_i64)
        .or_else(|| metadata.as_ref().and_then(|m| m.get("templateId")).and_then(as_i64));

    let event = obj
        .get("event")
        .or_else(|| obj.get("level"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default();

    let mut input = non_null(obj.get("input"));
    let message = non_null(obj.get("message"));
    if input.is_none() && !matches!(kind, EventKind::Log | EventKind::Run(RunType::Chat)) {
        input = legacy_history_input(obj.get("history"), message.as_ref());
    }

    let tokens_usage = obj
        .get("tokensUsage")
        .and_then(|v| serde_json::from_value::<TokenUsage>(v.clone()).ok());

    Ok(Event {
        kind,
        event,
        project_ref: obj
            .get("projectId")
            .or_else(|| obj.get("app"))
            .and_then(Value::as_str)
            .map(str::to_string),
        run_id,
        parent_run_id,
        timestamp,
        name,
        input,
        output: non_null(obj.get("output")),
        error: non_null(obj.get("error")),
        feedback: non_null(obj.get("feedback")),
        extra: non_null(obj.get("extra")),
        params: non_null(obj.get("params")),
        metadata,
        message,
        tags,
        thread_tags: obj.get("threadTags").and_then(string_list),
        template_id,
        tokens_usage,
        runtime: obj
            .get("runtime")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Convert `snake_case` and `kebab-case` keys to camelCase, recursively.
pub fn camelize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(camelize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (to_camel_case(k), camelize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '_' || c == '-' {
            if let Some(next) = chars.peek().copied() {
                if next.is_ascii_alphabetic() {
                    out.push(next.to_ascii_uppercase());
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Keep 36-character ids as-is and derive a UUID-shaped id from any other
/// non-empty string, so SDKs with their own id formats still link up.
pub fn ensure_uuid(id: &str) -> Option<String> {
    if id.is_empty() {
        return None;
    }
    if id.len() == 36 {
        return Some(id.to_string());
    }
    Some(uuid_from_seed(id))
}

/// Deterministic UUID-shaped string derived from the SHA-256 of `seed`.
pub fn uuid_from_seed(seed: &str) -> String {
    let hex = hex::encode(Sha256::digest(seed.as_bytes()));
    format!(
        "{}-{}-4{}-a{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[13..16],
        &hex[17..20],
        &hex[20..32]
    )
}

fn parse_run_id(raw: &str) -> Result<Option<Uuid>> {
    match ensure_uuid(raw) {
        None => Ok(None),
        Some(id) => Uuid::parse_str(&id)
            .map(Some)
            .map_err(|e| CoreError::InvalidId(format!("{}: {}", raw, e))),
    }
}

fn parse_timestamp(value: Option<&Value>) -> Result<DateTime<Utc>> {
    match value {
        Some(Value::String(s)) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| Utc.from_utc_datetime(&naive))
                .map_err(|_| CoreError::InvalidTimestamp(s.clone()))
        }
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| CoreError::InvalidTimestamp(n.to_string())),
        Some(other) => Err(CoreError::InvalidTimestamp(other.to_string())),
        None => Err(CoreError::InvalidTimestamp("missing".to_string())),
    }
}

/// Keep only first-level scalars (and arrays of scalars) in metadata.
fn clean_metadata(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    let cleaned: Map<String, Value> = obj
        .iter()
        .map(|(k, v)| {
            let kept = match v {
                Value::String(_) | Value::Number(_) | Value::Bool(_) => v.clone(),
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| if is_scalar(item) { item.clone() } else { Value::Null })
                        .collect(),
                ),
                _ => Value::Null,
            };
            (k.clone(), kept)
        })
        .collect();
    Some(Value::Object(cleaned))
}

fn is_scalar(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

/// Legacy report payloads carry the conversation as `history` plus the new
/// `message`; fold both into one input array.
fn legacy_history_input(history: Option<&Value>, message: Option<&Value>) -> Option<Value> {
    let mut items = match history? {
        Value::Array(items) => items.clone(),
        _ => Vec::new(),
    };
    if let Some(msg) = message {
        items.push(msg.clone());
    }
    Some(Value::Array(items))
}
