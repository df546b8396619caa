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

//! Input validation for API requests
//!
//! Request bodies are parsed into typed values at the boundary. Parsers
//! collect every problem they find as a [`FieldError`] instead of stopping at
//! the first, and the handler turns the list into a single 400 response.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::api::ApiError;

/// Maximum events accepted in one ingestion request
pub const MAX_EVENTS_PER_BATCH: usize = 10_000;

/// Maximum usage window in days
pub const MAX_WINDOW_DAYS: i64 = 366;

pub const MISSING_EVENTS: &str = "Missing events payload.";

/// One problem with one request field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Outcome of parsing a request: the typed value or every field error found
pub type Validated<T> = Result<T, Vec<FieldError>>;

impl From<Vec<FieldError>> for ApiError {
    fn from(errors: Vec<FieldError>) -> Self {
        let message = match errors.as_slice() {
            [only] => only.message.clone(),
            many => many
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect::<Vec<_>>()
                .join("; "),
        };
        ApiError::BadRequest(message)
    }
}

/// A parsed ingestion request
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub project_id: Uuid,
    pub events: Vec<Value>,
}

impl IngestRequest {
    /// Parse an ingestion body.
    ///
    /// `events` may be one event object or an array of them. The project is
    /// taken from `query_project`, then the body's `projectId`/`appId`, then
    /// the first event's `projectId`/`app`.
    pub fn parse(body: &Value, query_project: Option<&str>) -> Validated<Self> {
        let mut errors = Vec::new();

        let events = match body.get("events") {
            Some(Value::Array(items)) if !items.is_empty() => Some(items.clone()),
            Some(event @ Value::Object(_)) => Some(vec![event.clone()]),
            _ => {
                errors.push(FieldError::new("events", MISSING_EVENTS));
                None
            }
        };
        if let Some(events) = &events {
            if events.len() > MAX_EVENTS_PER_BATCH {
                errors.push(FieldError::new(
                    "events",
                    format!(
                        "Batch of {} events exceeds the limit of {}",
                        events.len(),
                        MAX_EVENTS_PER_BATCH
                    ),
                ));
            }
        }

        let project_ref = query_project
            .map(str::to_string)
            .or_else(|| body_project(body))
            .or_else(|| {
                events.as_ref().and_then(|events| {
                    events.first().and_then(|event| {
                        ["projectId", "project_id", "app"]
                            .iter()
                            .find_map(|k| event.get(*k))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                })
            });
        let project_id = match project_ref {
            Some(raw) => parse_uuid_field("projectId", &raw)
                .map_err(|e| errors.push(e))
                .ok(),
            None => {
                // Only worth reporting once the events themselves are usable
                if events.is_some() {
                    errors.push(FieldError::new("projectId", "Missing project id"));
                }
                None
            }
        };

        match (project_id, events) {
            (Some(project_id), Some(events)) if errors.is_empty() => {
                Ok(Self { project_id, events })
            }
            _ => Err(errors),
        }
    }
}

/// Optional project filter in a body: `projectId`, `project_id` or `appId`.
pub fn body_project(body: &Value) -> Option<String> {
    ["projectId", "project_id", "appId", "app_id"]
        .iter()
        .find_map(|k| body.get(*k))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn parse_uuid_field(field: &str, raw: &str) -> Result<Uuid, FieldError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| FieldError::new(field, "Incorrect project id format"))
}

/// `project_id` query parameter, required.
pub fn require_project(raw: Option<&str>) -> Result<Uuid, ApiError> {
    let raw = raw.ok_or_else(|| ApiError::BadRequest("project_id is required".to_string()))?;
    parse_uuid_field("project_id", raw).map_err(|e| ApiError::from(vec![e]))
}

/// Validate a usage window
pub fn validate_window_days(days: i64) -> Result<(), ApiError> {
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(ApiError::BadRequest(format!(
            "days must be between 1 and {}, got {}",
            MAX_WINDOW_DAYS, days
        )));
    }
    Ok(())
}

/// A parsed check tree: `["AND"|"OR", element, ...]` where each element is a
/// `{id, params}` object or a nested tree.
pub fn parse_check_logic(value: &Value) -> Validated<Value> {
    let mut errors = Vec::new();
    check_node(value, "checks", &mut errors, true);
    if errors.is_empty() {
        Ok(value.clone())
    } else {
        Err(errors)
    }
}

fn check_node(value: &Value, path: &str, errors: &mut Vec<FieldError>, root: bool) {
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let child = format!("{}[{}]", path, i);
                match item {
                    Value::String(op) if i == 0 => {
                        if op != "AND" && op != "OR" {
                            errors.push(FieldError::new(
                                &child,
                                format!("unknown operator '{}'", op),
                            ));
                        }
                    }
                    other => check_node(other, &child, errors, false),
                }
            }
        }
        Value::Object(obj) if !root => {
            if !obj.get("id").map_or(false, Value::is_string) {
                errors.push(FieldError::new(path, "check id must be a string"));
            }
            if let Some(params) = obj.get("params") {
                if !params.is_object() && !params.is_null() {
                    errors.push(FieldError::new(path, "check params must be an object"));
                }
            }
        }
        Value::Null if !root => {}
        _ => errors.push(FieldError::new(path, "expected a check list")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_events_must_be_present() {
        let errors = IngestRequest::parse(&json!({"events": "not-an-array"}), None).unwrap_err();
        assert_eq!(errors, vec![FieldError::new("events", MISSING_EVENTS)]);

        let errors = IngestRequest::parse(&json!({}), None).unwrap_err();
        assert_eq!(errors[0].message, MISSING_EVENTS);

        match ApiError::from(errors) {
            ApiError::BadRequest(msg) => assert_eq!(msg, MISSING_EVENTS),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_project_resolution_order() {
        let query = Uuid::new_v4();
        let body = Uuid::new_v4();
        let event = Uuid::new_v4();
        let payload = json!({
            "projectId": body.to_string(),
            "events": [{"type": "llm", "projectId": event.to_string()}]
        });

        let parsed = IngestRequest::parse(&payload, Some(&query.to_string())).unwrap();
        assert_eq!(parsed.project_id, query);
        assert_eq!(IngestRequest::parse(&payload, None).unwrap().project_id, body);

        let legacy = json!({"events": {"type": "llm", "app": event.to_string()}});
        let parsed = IngestRequest::parse(&legacy, None).unwrap();
        assert_eq!(parsed.project_id, event);
        assert_eq!(parsed.events.len(), 1);
    }

    #[test]
    fn test_bad_project_id_is_field_error() {
        let errors =
            IngestRequest::parse(&json!({"events": [{}]}), Some("not-a-uuid")).unwrap_err();
        assert_eq!(errors[0].field, "projectId");

        let errors = IngestRequest::parse(&json!({"events": [{}]}), None).unwrap_err();
        assert_eq!(errors[0].message, "Missing project id");
    }

    #[test]
    fn test_check_logic_errors_are_collected() {
        assert!(parse_check_logic(&json!(["AND", {"id": "pii"}, ["OR", {"id": "json"}]])).is_ok());
        assert!(parse_check_logic(&json!([])).is_ok());

        let errors =
            parse_check_logic(&json!(["XOR", {"params": {}}, {"id": "regex", "params": 3}]))
                .unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["checks[0]", "checks[1]", "checks[2]"]);

        assert!(parse_check_logic(&json!({"id": "pii"})).is_err());
    }

    #[test]
    fn test_window_days_bounds() {
        assert!(validate_window_days(30).is_ok());
        assert!(validate_window_days(0).is_err());
        assert!(validate_window_days(400).is_err());
    }
}
