//! Conversation messages and the history-integrity check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use super::results::LlmResponse;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool arguments as decoded from the model: parameter name to value.
pub type ArgumentMap = serde_json::Map<String, serde_json::Value>;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within the assistant message that carries it.
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: ArgumentMap,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: ArgumentMap) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    /// Arguments as a JSON object value.
    pub fn arguments_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.arguments.clone())
    }
}

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Extended reasoning text (assistant only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Backend signature over `thinking`; required to replay it to Anthropic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_signature: Option<String>,
    /// Opaque encrypted reasoning blocks, replayed verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redacted_thinking: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// The tool message reports a failed call.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thinking: None,
            thinking_signature: None,
            redacted_thinking: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant message requesting tool calls.
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Tool result message answering `tool_call_id`.
    pub fn tool(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// Build the assistant message for a decoded model response.
    pub fn from_response(response: &LlmResponse) -> Self {
        Self {
            thinking: response.thinking.clone().filter(|t| !t.is_empty()),
            thinking_signature: response.thinking_signature.clone(),
            redacted_thinking: response.redacted_thinking.clone(),
            tool_calls: response.tool_calls.clone(),
            ..Self::new(Role::Assistant, response.content.clone())
        }
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    pub fn with_thinking_signature(mut self, signature: impl Into<String>) -> Self {
        self.thinking_signature = Some(signature.into());
        self
    }

    /// Mark a tool message as reporting a failed call.
    pub fn with_is_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A structural violation found by [`validate_history`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("history is empty")]
    Empty,
    #[error("first message is {0}, expected system")]
    MissingSystem(Role),
    #[error("extra system message at index {0}")]
    ExtraSystem(usize),
    #[error("tool message at index {0} has no tool_call_id")]
    MissingToolCallId(usize),
    #[error("tool message at index {index} answers unknown call '{tool_call_id}'")]
    OrphanToolResult { index: usize, tool_call_id: String },
    #[error("tool call '{tool_call_id}' answered twice (index {index})")]
    DuplicateToolResult { index: usize, tool_call_id: String },
    #[error("assistant message at index {index} is followed by {role} before all tool results arrived")]
    IncompleteToolResults { index: usize, role: Role },
}

/// Check the structural invariants of a conversation log.
///
/// Exactly one system message, first. Every tool message answers a call of
/// the nearest preceding assistant message (only tool messages in between),
/// at most once. An assistant turn's results must all be present before the
/// next non-tool message; a trailing turn may still be waiting for them.
pub fn validate_history(messages: &[Message]) -> Result<(), HistoryError> {
    let first = messages.first().ok_or(HistoryError::Empty)?;
    if first.role != Role::System {
        return Err(HistoryError::MissingSystem(first.role));
    }

    // (assistant index, call ids, ids answered so far)
    let mut open: Option<(usize, Vec<&str>, Vec<&str>)> = None;

    for (index, message) in messages.iter().enumerate().skip(1) {
        match message.role {
            Role::System => return Err(HistoryError::ExtraSystem(index)),
            Role::Tool => {
                let id = message
                    .tool_call_id
                    .as_deref()
                    .ok_or(HistoryError::MissingToolCallId(index))?;
                let Some((_, calls, answered)) = open.as_mut() else {
                    return Err(HistoryError::OrphanToolResult {
                        index,
                        tool_call_id: id.to_string(),
                    });
                };
                if !calls.contains(&id) {
                    return Err(HistoryError::OrphanToolResult {
                        index,
                        tool_call_id: id.to_string(),
                    });
                }
                if answered.contains(&id) {
                    return Err(HistoryError::DuplicateToolResult {
                        index,
                        tool_call_id: id.to_string(),
                    });
                }
                answered.push(id);
            }
            role @ (Role::User | Role::Assistant) => {
                if let Some((assistant_index, calls, answered)) = open.take() {
                    if answered.len() < calls.len() {
                        return Err(HistoryError::IncompleteToolResults {
                            index: assistant_index,
                            role,
                        });
                    }
                }
                if role == Role::Assistant && message.has_tool_calls() {
                    let calls = message.tool_calls.iter().map(|c| c.id.as_str()).collect();
                    open = Some((index, calls, Vec::new()));
                }
            }
        }
    }

    Ok(())
}
