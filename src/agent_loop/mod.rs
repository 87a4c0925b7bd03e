//! Agent loop: state machine, token budget, and run events.

pub mod compaction;
pub mod events;
pub mod runner;
pub mod types;

pub use compaction::{
    estimate_tokens, CompactionReport, ProviderSummarizer, Summarizer, TokenBudget,
    SUMMARY_PREFIX,
};
pub use events::{AgentEvent, AgentEventSink, EventBroker, RunEvent};
pub use runner::AgentLoop;
pub use types::{LoopOutcome, LoopStats, LoopStatus, SessionId, TRUNCATION_MARKER};
