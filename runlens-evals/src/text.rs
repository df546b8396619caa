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

//! Text extraction from run fields

use serde_json::Value;

use runlens_core::Run;

/// The `input`, `output` or `error` field of a run by name.
pub fn run_field<'a>(run: &'a Run, field: &str) -> Option<&'a Value> {
    match field {
        "input" => run.input.as_ref(),
        "output" => run.output.as_ref(),
        "error" => run.error.as_ref(),
        _ => None,
    }
}

fn is_message(value: &Value) -> bool {
    value.get("role").map_or(false, Value::is_string)
        && ["content", "toolCalls", "functionCall", "tool_calls"]
            .iter()
            .any(|k| value.get(*k).map_or(false, |v| !v.is_null()))
}

fn content_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Text a check should look at for a field.
///
/// Strings are returned as-is. For an array of messages the last message's
/// content is used, for a single message its content. Anything else is
/// serialized as JSON. Absent or null fields yield `None`.
pub fn last_message(field: Option<&Value>) -> Option<String> {
    match field? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if items.first().map_or(false, is_message) => {
            items.last().map(content_text)
        }
        value if is_message(value) => Some(content_text(value)),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_message_shapes() {
        assert_eq!(last_message(Some(&json!("plain"))), Some("plain".into()));
        assert_eq!(
            last_message(Some(&json!([
                {"role": "user", "content": "q"},
                {"role": "assistant", "content": "a"}
            ]))),
            Some("a".into())
        );
        assert_eq!(
            last_message(Some(&json!({"role": "assistant", "content": "single"}))),
            Some("single".into())
        );
        assert_eq!(
            last_message(Some(&json!({"answer": 42}))),
            Some("{\"answer\":42}".into())
        );
        assert_eq!(last_message(None), None);
        assert_eq!(last_message(Some(&Value::Null)), None);
    }

    #[test]
    fn test_tool_call_message_has_empty_text() {
        let field = json!([{"role": "assistant", "content": null, "toolCalls": [{"id": "1"}]}]);
        assert_eq!(last_message(Some(&field)), Some(String::new()));
    }
}
