//! Core run types for the agent loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::error::TillerError;
use crate::types::{Message, TokenUsage};

/// Identifier shared by every run of one conversation.
pub type SessionId = Uuid;

/// Appended to the final content when the step limit ends a task.
pub const TRUNCATION_MARKER: &str = "[incomplete: maximum steps reached]";

/// Loop state. Every state except `Running` is terminal for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Cancelled,
    Done,
    MaxStepsReached,
    Failed,
}

/// What a finished task hands back to the caller.
#[derive(Debug)]
pub struct LoopOutcome {
    pub status: LoopStatus,
    /// Full history after the task, a clean prefix when cancelled.
    pub messages: Vec<Message>,
    /// The final answer for `Done`; the last assistant content plus
    /// [`TRUNCATION_MARKER`] for `MaxStepsReached`.
    pub final_content: Option<String>,
    /// Model calls made for this task.
    pub steps: usize,
    /// Usage reported by the backend during this task.
    pub usage: TokenUsage,
    /// Terminal error for `Failed`.
    pub error: Option<TillerError>,
    pub finished_at: DateTime<Utc>,
}

impl LoopOutcome {
    pub fn is_done(&self) -> bool {
        self.status == LoopStatus::Done
    }

    /// Retry attempts behind a `Failed` outcome.
    pub fn attempts(&self) -> Option<u32> {
        self.error.as_ref().and_then(TillerError::attempts)
    }
}

/// Snapshot of a loop's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStats {
    pub session_id: SessionId,
    pub message_count: usize,
    pub estimated_tokens: usize,
    /// Last usage reported by the backend, cleared by summarization.
    pub last_usage: Option<TokenUsage>,
    pub cumulative_usage: TokenUsage,
    pub tool_count: usize,
    pub parallel_tools: bool,
    pub enable_thinking: bool,
}
