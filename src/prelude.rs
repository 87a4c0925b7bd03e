//! Convenience re-exports for common use.

pub use tokio_util::sync::CancellationToken;

pub use crate::agent_loop::{
    AgentEvent, AgentEventSink, AgentLoop, EventBroker, LoopOutcome, LoopStats, LoopStatus,
    RunEvent, Summarizer, TRUNCATION_MARKER,
};
pub use crate::config::{AgentConfig, RuntimeConfig};
pub use crate::error::{ProviderError, ProviderErrorKind, Result, TillerError};
pub use crate::provider::{
    create_named_provider, create_provider, ModelProvider, ProviderKind, ProviderRequest,
};
pub use crate::tools::{
    process_tool, AgentTool, AgentToolParameters, ProcessManager, Tool, ToolArguments,
    ToolExecutionContext, ToolRegistry,
};
pub use crate::types::{
    FinishReason, GenerationSettings, LlmResponse, Message, Role, TokenUsage, ToolCall,
    ToolResult,
};
pub use crate::util::retry::RetryPolicy;
