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

//! Chat thread reconciliation
//!
//! A chat thread is a `thread` run whose children each hold one exchange:
//! the user/system turns in `input` and the assistant/tool turns in `output`.
//! Messages arrive one at a time and are folded into the latest exchange or
//! open a new one.

use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use runlens_core::{Event, Run, RunType};
use runlens_storage::RunStore;

use super::IngestError;

const OUTPUT_ROLES: &[&str] = &["assistant", "tool", "bot"];
const INPUT_ROLES: &[&str] = &["user", "system"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Input,
    Output,
}

impl Side {
    fn of(role: &str) -> Option<Self> {
        if INPUT_ROLES.contains(&role) {
            Some(Side::Input)
        } else if OUTPUT_ROLES.contains(&role) {
            Some(Side::Output)
        } else {
            None
        }
    }
}

/// What to do with an incoming message given the thread's latest exchange
#[derive(Debug, Clone, PartialEq)]
enum ChatAction {
    /// Open a new exchange
    Insert {
        input: Option<Value>,
        output: Option<Value>,
        sibling_of: Option<Uuid>,
    },
    /// Rewrite the message arrays of an existing exchange
    Update {
        id: Uuid,
        input: Option<Value>,
        output: Option<Value>,
    },
}

fn plan(previous: Option<&Run>, side: Side, message: &Value, is_retry: bool) -> ChatAction {
    let single = || Some(json!([message]));
    let Some(previous) = previous else {
        return ChatAction::Insert {
            input: (side == Side::Input).then(single).flatten(),
            output: (side == Side::Output).then(single).flatten(),
            sibling_of: None,
        };
    };

    if is_retry {
        return ChatAction::Insert {
            input: match side {
                Side::Input => single(),
                Side::Output => previous.input.clone(),
            },
            output: (side == Side::Output).then(single).flatten(),
            sibling_of: Some(previous.id),
        };
    }

    match side {
        Side::Output => ChatAction::Update {
            id: previous.id,
            input: None,
            output: Some(append(previous.output.as_ref(), message)),
        },
        Side::Input if has_content(previous.output.as_ref()) => ChatAction::Insert {
            input: single(),
            output: None,
            sibling_of: None,
        },
        Side::Input => ChatAction::Update {
            id: previous.id,
            input: Some(append(previous.input.as_ref(), message)),
            output: None,
        },
    }
}

fn has_content(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(_) => true,
    }
}

fn append(existing: Option<&Value>, message: &Value) -> Value {
    let mut items = match existing {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    };
    items.push(message.clone());
    Value::Array(items)
}

/// The stored form of a chat message: role, content and optional metadata.
fn core_message(message: &Map<String, Value>, role: &str) -> Value {
    let mut core = Map::new();
    core.insert("role".to_string(), Value::String(role.to_string()));
    if let Some(content) = message.get("content") {
        core.insert("content".to_string(), content.clone());
    }
    if let Some(meta) = message
        .get("metadata")
        .or_else(|| message.get("extra"))
        .filter(|m| !m.is_null())
    {
        core.insert("metadata".to_string(), meta.clone());
    }
    Value::Object(core)
}

/// Fold a `chat` event into its thread.
pub(super) async fn reconcile(
    runs: &RunStore,
    project_id: Uuid,
    event: &Event,
) -> Result<(), IngestError> {
    let thread_id = event
        .parent_run_id
        .ok_or_else(|| IngestError::Invalid("chat events require parentRunId".to_string()))?;
    let run_id = event
        .run_id
        .ok_or_else(|| IngestError::Invalid("runId is required".to_string()))?;
    let message = event
        .message
        .as_ref()
        .and_then(Value::as_object)
        .ok_or_else(|| IngestError::Invalid("chat events require a message".to_string()))?;
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| IngestError::Invalid("message.role is required".to_string()))?;
    let side = Side::of(role)
        .ok_or_else(|| IngestError::Invalid(format!("unsupported message role '{}'", role)))?;
    let is_retry = message
        .get("isRetry")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let core = core_message(message, role);

    let mut thread = Run::new(thread_id, project_id, RunType::Thread, event.timestamp);
    thread.tags = event.thread_tags.clone().unwrap_or_default();
    thread.input = Some(core.clone());
    runs.upsert_thread(&thread).await?;
    if !runs.run_exists(project_id, thread_id).await? {
        return Err(IngestError::Invalid(format!(
            "thread {} belongs to another project",
            thread_id
        )));
    }

    let previous = runs.latest_child(thread_id).await?;
    let action = plan(previous.as_ref(), side, &core, is_retry);
    debug!("Chat message {} on thread {}: {:?}", run_id, thread_id, action);

    match action {
        ChatAction::Insert {
            input,
            output,
            sibling_of,
        } => {
            let mut run = match (&previous, sibling_of) {
                // A retry starts from a copy of the exchange it replaces
                (Some(previous), Some(_)) => {
                    let mut copy = previous.clone();
                    copy.id = run_id;
                    copy.created_at = event.timestamp;
                    copy
                }
                _ => Run::new(run_id, project_id, RunType::Chat, event.timestamp),
            };
            run.run_type = RunType::Chat;
            run.parent_run_id = Some(thread_id);
            run.sibling_run_id = sibling_of;
            run.ended_at = Some(event.timestamp);
            run.input = input;
            run.output = output;
            run.feedback = event.feedback.clone();
            if let Some(tags) = message_tags(message) {
                run.tags = tags;
            }
            if let Some(meta) = core.get("metadata") {
                run.metadata = Some(meta.clone());
            }
            runs.insert_run(&run).await?;
        }
        ChatAction::Update { id, input, output } => {
            runs.update_messages(id, input.as_ref(), output.as_ref(), event.timestamp)
                .await?;
        }
    }
    Ok(())
}

fn message_tags(message: &Map<String, Value>) -> Option<Vec<String>> {
    match message.get("tags")? {
        Value::String(tag) => Some(vec![tag.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}
