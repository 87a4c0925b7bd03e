//! Streaming deltas and their accumulation into a response.

use super::generation::FinishReason;
use super::message::ToolCall;
use super::results::LlmResponse;
use super::usage::TokenUsage;

/// One decoded piece of a streamed model answer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Thinking(String),
    /// Piece of the signature over the thinking text.
    ThinkingSignature(String),
    /// One whole redacted reasoning block.
    RedactedThinking(String),
    /// A tool call whose arguments have been fully received and decoded.
    ToolCall(ToolCall),
    /// Partial usage; non-zero fields overwrite what was seen before.
    Usage(TokenUsage),
    Finish(FinishReason),
}

/// Folds [`StreamDelta`]s into one [`LlmResponse`].
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    content: String,
    thinking: String,
    signature: String,
    redacted_thinking: Vec<String>,
    tool_calls: Vec<ToolCall>,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: StreamDelta) {
        match delta {
            StreamDelta::Text(text) => self.content.push_str(&text),
            StreamDelta::Thinking(text) => self.thinking.push_str(&text),
            StreamDelta::ThinkingSignature(part) => self.signature.push_str(&part),
            StreamDelta::RedactedThinking(data) => self.redacted_thinking.push(data),
            StreamDelta::ToolCall(call) => self.tool_calls.push(call),
            StreamDelta::Usage(usage) => {
                if usage.prompt_tokens > 0 {
                    self.usage.prompt_tokens = usage.prompt_tokens;
                }
                if usage.completion_tokens > 0 {
                    self.usage.completion_tokens = usage.completion_tokens;
                }
                if usage.total_tokens > 0 {
                    self.usage.total_tokens = usage.total_tokens;
                }
            }
            StreamDelta::Finish(reason) => self.finish_reason = Some(reason),
        }
    }

    pub fn finish(self) -> LlmResponse {
        let mut usage = self.usage;
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }
        let finish_reason = match self.finish_reason {
            Some(reason) => reason,
            None if !self.tool_calls.is_empty() => FinishReason::ToolCalls,
            None => FinishReason::Stop,
        };
        LlmResponse {
            content: self.content,
            thinking: (!self.thinking.is_empty()).then_some(self.thinking),
            thinking_signature: (!self.signature.is_empty()).then_some(self.signature),
            redacted_thinking: self.redacted_thinking,
            tool_calls: self.tool_calls,
            finish_reason,
            usage,
        }
    }
}
