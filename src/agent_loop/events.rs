//! Run event stream types.
//!
//! Events are fire-and-forget notifications for UIs and loggers. Emission
//! never blocks the loop and a loop without a sink behaves identically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::types::{LoopStatus, SessionId};
use crate::types::{TokenUsage, ToolCall, ToolResult};

/// Callback receiving run events.
pub type AgentEventSink = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// Event payloads emitted by the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStarted {
        user_input: String,
    },
    TurnStarted {
        step: usize,
    },
    HistorySummarized {
        runs: usize,
        tokens_before: usize,
        tokens_after: usize,
    },
    AssistantDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    TokenUpdate {
        estimated: usize,
        reported: Option<TokenUsage>,
        limit: usize,
    },
    ToolStarted {
        step: usize,
        index: usize,
        call: ToolCall,
    },
    ToolCompleted {
        step: usize,
        index: usize,
        call_id: String,
        tool_name: String,
        result: ToolResult,
        duration_ms: u64,
        /// False when the call was aborted by cancellation.
        completed: bool,
    },
    TurnEnded {
        step: usize,
        tool_calls: usize,
    },
    AgentFinished {
        status: LoopStatus,
        steps: usize,
    },
}

/// Envelope for run events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub session_id: SessionId,
    /// Strictly increasing within one loop.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: AgentEvent,
}

pub(crate) struct RunEventEmitter {
    session_id: SessionId,
    seq: AtomicU64,
    sink: Option<AgentEventSink>,
}

impl RunEventEmitter {
    pub(crate) fn new(session_id: SessionId, sink: Option<AgentEventSink>) -> Self {
        Self {
            session_id,
            seq: AtomicU64::new(1),
            sink,
        }
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        let Some(sink) = &self.sink else { return };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        (sink)(RunEvent {
            session_id: self.session_id,
            seq,
            timestamp: Utc::now(),
            event,
        });
    }

    pub(crate) fn is_active(&self) -> bool {
        self.sink.is_some()
    }
}

/// Fan-out of run events to any number of subscribers.
///
/// Backed by a bounded broadcast channel: publishing never waits, and a
/// subscriber that falls behind loses its oldest events.
#[derive(Debug, Clone)]
pub struct EventBroker {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Deliver to current subscribers; a no-op when nobody listens.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sink that publishes into this broker, for [`AgentLoop`](super::AgentLoop).
    pub fn sink(&self) -> AgentEventSink {
        let broker = self.clone();
        Arc::new(move |event| broker.publish(event))
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(256)
    }
}
