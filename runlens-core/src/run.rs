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

//! Run records and the chat messages derived from them
//!
//! A run is one recorded execution unit reported by a client SDK: an LLM
//! call, a chain or agent step, a tool invocation, or the marker run that
//! anchors a conversation thread. Runs form a forest through `parent_run_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

/// Kind of execution unit a run represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Llm,
    Chain,
    Tool,
    Agent,
    Thread,
    Chat,
    Embed,
    Retriever,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Llm => "llm",
            RunType::Chain => "chain",
            RunType::Tool => "tool",
            RunType::Agent => "agent",
            RunType::Thread => "thread",
            RunType::Chat => "chat",
            RunType::Embed => "embed",
            RunType::Retriever => "retriever",
        }
    }

    /// Thread markers anchor a conversation and never have a parent.
    pub fn is_root_only(&self) -> bool {
        matches!(self, RunType::Thread)
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm" => Ok(RunType::Llm),
            "chain" => Ok(RunType::Chain),
            "tool" => Ok(RunType::Tool),
            "agent" => Ok(RunType::Agent),
            // "convo" is the legacy name of the thread marker
            "thread" | "convo" => Ok(RunType::Thread),
            "chat" | "message" => Ok(RunType::Chat),
            "embed" => Ok(RunType::Embed),
            "retriever" => Ok(RunType::Retriever),
            other => Err(CoreError::UnknownRunType(other.to_string())),
        }
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(RunStatus::Started),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            other => Err(CoreError::UnknownRunStatus(other.to_string())),
        }
    }
}

/// A persisted execution event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub project_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub run_type: RunType,
    #[serde(default)]
    pub name: Option<String>,
    /// Graph edge to the parent run, never ownership
    #[serde(default)]
    pub parent_run_id: Option<Uuid>,
    #[serde(default)]
    pub sibling_run_id: Option<Uuid>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub prompt_tokens: Option<i64>,
    #[serde(default)]
    pub completion_tokens: Option<i64>,
    #[serde(default)]
    pub cached_prompt_tokens: Option<i64>,
    /// Derived; populated at ingestion or by the backfill job
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub feedback: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub template_version_id: Option<i64>,
    /// SDK that reported the run, e.g. `runlens-py`
    #[serde(default)]
    pub runtime: Option<String>,
}

impl Run {
    /// Create a bare run with the given identity; every optional field empty.
    pub fn new(id: Uuid, project_id: Uuid, run_type: RunType, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            project_id,
            created_at,
            ended_at: None,
            run_type,
            name: None,
            parent_run_id: None,
            sibling_run_id: None,
            input: None,
            output: None,
            error: None,
            tags: Vec::new(),
            params: None,
            prompt_tokens: None,
            completion_tokens: None,
            cached_prompt_tokens: None,
            cost: None,
            status: None,
            feedback: None,
            metadata: None,
            template_version_id: None,
            runtime: None,
        }
    }

    /// Wall-clock duration in milliseconds, when the run has ended.
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|ended| (ended - self.created_at).num_milliseconds())
    }

    pub fn total_tokens(&self) -> Option<i64> {
        match (self.prompt_tokens, self.completion_tokens) {
            (None, None) => None,
            (p, c) => Some(p.unwrap_or(0) + c.unwrap_or(0)),
        }
    }

    /// Check the structural invariants a stored run must satisfy.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.run_type.is_root_only() && self.parent_run_id.is_some() {
            return Err(CoreError::InvalidEvent(format!(
                "thread run {} cannot have a parent",
                self.id
            )));
        }
        if self.parent_run_id == Some(self.id) {
            return Err(CoreError::InvalidEvent(format!(
                "run {} cannot be its own parent",
                self.id
            )));
        }
        if let Some(cost) = self.cost {
            if cost < 0.0 || !cost.is_finite() {
                return Err(CoreError::InvalidEvent(format!(
                    "run {} has invalid cost {}",
                    self.id, cost
                )));
            }
        }
        if let Some(ended) = self.ended_at {
            if ended < self.created_at {
                return Err(CoreError::InvalidEvent(format!(
                    "run {} ends before it starts",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// One chat turn extracted from a run's input or output array.
///
/// Messages have no identity of their own. Every field of the source object
/// other than `role` is preserved verbatim in `body`, so text, structured
/// content, and tool-call payloads all survive the round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
    /// Inherited from the owning run
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message from a message-shaped JSON value: an object with a
    /// string `role`. Anything else yields `None`.
    pub fn from_value(value: &Value, created_at: DateTime<Utc>) -> Option<Self> {
        let obj = value.as_object()?;
        let role = obj.get("role")?.as_str()?.to_string();
        let body = obj
            .iter()
            .filter(|(k, _)| k.as_str() != "role" && k.as_str() != "createdAt")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(Self {
            role,
            body,
            created_at,
        })
    }

    /// Text of the message, from `content` or the legacy `text` field.
    pub fn text(&self) -> Option<&str> {
        self.body
            .get("content")
            .or_else(|| self.body.get("text"))
            .and_then(|v| v.as_str())
    }

    /// Function or tool-call payload, if the message carries one.
    pub fn tool_calls(&self) -> Option<&Value> {
        self.body
            .get("toolCalls")
            .or_else(|| self.body.get("functionCall"))
    }
}
