//! History compaction under a token budget.
//!
//! User messages are kept verbatim. Each closed run of assistant and tool
//! messages between two user messages is replaced by one assistant summary
//! message; the run after the last user message is live and never touched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SummarizationError;
use crate::provider::{ModelProvider, ProviderRequest};
use crate::types::{GenerationSettings, Message, Role, TokenUsage};
use crate::util::retry::RetryPolicy;
use crate::util::timeout::with_timeout;

/// Prefix marking synthetic summary messages.
pub const SUMMARY_PREFIX: &str = "[conversation summary]";

const MESSAGE_OVERHEAD_TOKENS: usize = 4;
const CHARS_PER_TOKEN: usize = 4;

const SUMMARY_PROMPT: &str = "You compress agent transcripts. Summarize the \
assistant and tool activity below in a few sentences. Keep decisions, facts \
learned, files or resources touched, tool outcomes and anything left \
unfinished. Reply with the summary only.";

fn text_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Approximate token count of one message.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS + text_tokens(&message.content);
    if let Some(thinking) = &message.thinking {
        tokens += text_tokens(thinking);
    }
    for call in &message.tool_calls {
        tokens += text_tokens(&call.tool_name);
        tokens += text_tokens(&call.arguments_value().to_string());
    }
    if let Some(name) = &message.tool_name {
        tokens += text_tokens(name);
    }
    tokens
}

/// Approximate token count of a history, without a tokenizer.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

pub fn is_summary(message: &Message) -> bool {
    message.role == Role::Assistant
        && !message.has_tool_calls()
        && message.content.starts_with(SUMMARY_PREFIX)
}

/// Produces the text of one summary message.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a closed run of assistant and tool messages.
    async fn summarize(
        &self,
        run: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, SummarizationError>;
}

/// Summarizes by asking the model, with the loop's retry policy.
pub struct ProviderSummarizer {
    provider: Arc<dyn ModelProvider>,
    retry: RetryPolicy,
    timeout: Duration,
    settings: GenerationSettings,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn ModelProvider>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            timeout,
            settings: GenerationSettings::default(),
        }
    }
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(
        &self,
        run: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, SummarizationError> {
        let messages = [Message::system(SUMMARY_PROMPT), Message::user(render_run(run))];
        let request = ProviderRequest {
            messages: &messages,
            tools: &[],
            settings: &self.settings,
        };
        let call = self
            .retry
            .execute(|| with_timeout(self.timeout, self.provider.generate(&request)));

        let response = tokio::select! {
            result = call => result.map_err(|e| SummarizationError::Call(Box::new(e)))?,
            _ = cancel.cancelled() => return Err(SummarizationError::Cancelled),
        };

        let summary = response.content.trim();
        if summary.is_empty() {
            return Err(SummarizationError::Empty);
        }
        Ok(summary.to_string())
    }
}

fn render_run(run: &[Message]) -> String {
    let mut out = String::new();
    for message in run {
        match message.role {
            Role::Tool => {
                let name = message.tool_name.as_deref().unwrap_or("tool");
                out.push_str(&format!("[tool result: {name}]\n{}\n", message.content));
            }
            role => {
                out.push_str(&format!("[{role}]\n"));
                if !message.content.is_empty() {
                    out.push_str(&message.content);
                    out.push('\n');
                }
                for call in &message.tool_calls {
                    out.push_str(&format!(
                        "-> {}({})\n",
                        call.tool_name,
                        call.arguments_value()
                    ));
                }
            }
        }
    }
    out
}

/// What a compaction pass changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub runs: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Token budget state: the limit plus the last total reported by the backend.
#[derive(Debug, Clone, Default)]
pub struct TokenBudget {
    limit: usize,
    last_reported: Option<TokenUsage>,
}

impl TokenBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            last_reported: None,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn last_reported(&self) -> Option<&TokenUsage> {
        self.last_reported.as_ref()
    }

    /// Remember backend usage; all-zero usage means the backend sent none.
    pub fn record_usage(&mut self, usage: &TokenUsage) {
        if !usage.is_zero() {
            self.last_reported = Some(*usage);
        }
    }

    pub fn clear(&mut self) {
        self.last_reported = None;
    }

    /// Either the local estimate or the reported total exceeds the limit.
    pub fn is_over(&self, messages: &[Message]) -> bool {
        let reported = self
            .last_reported
            .map(|u| u.total_tokens as usize)
            .unwrap_or(0);
        estimate_tokens(messages) > self.limit || reported > self.limit
    }

    /// Summarize closed runs when over budget.
    ///
    /// Returns `Ok(None)` when nothing changed. On error `messages` is left
    /// exactly as it was.
    pub async fn compact(
        &mut self,
        messages: &mut Vec<Message>,
        summarizer: &dyn Summarizer,
        cancel: &CancellationToken,
    ) -> Result<Option<CompactionReport>, SummarizationError> {
        if !self.is_over(messages) {
            return Ok(None);
        }

        let runs = closed_runs(messages);
        if runs.is_empty() {
            debug!(limit = self.limit, "over token budget with nothing to summarize");
            return Ok(None);
        }

        let tokens_before = estimate_tokens(messages);
        let mut summaries = Vec::with_capacity(runs.len());
        for range in &runs {
            let summary = summarizer.summarize(&messages[range.clone()], cancel).await?;
            summaries.push(Message::assistant(format!("{SUMMARY_PREFIX}\n{summary}")));
        }

        let mut compacted = Vec::with_capacity(messages.len());
        let mut next = 0;
        for (range, summary) in runs.iter().zip(summaries) {
            compacted.extend_from_slice(&messages[next..range.start]);
            compacted.push(summary);
            next = range.end;
        }
        compacted.extend_from_slice(&messages[next..]);
        *messages = compacted;

        self.clear();
        let report = CompactionReport {
            runs: runs.len(),
            tokens_before,
            tokens_after: estimate_tokens(messages),
        };
        info!(
            runs = report.runs,
            tokens_before = report.tokens_before,
            tokens_after = report.tokens_after,
            "history summarized"
        );
        Ok(Some(report))
    }
}

/// Ranges of closed runs that are not already a single summary.
fn closed_runs(messages: &[Message]) -> Vec<std::ops::Range<usize>> {
    let users: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();

    users
        .windows(2)
        .map(|pair| pair[0] + 1..pair[1])
        .filter(|range| {
            let run = &messages[range.clone()];
            !run.is_empty() && !(run.len() == 1 && is_summary(&run[0]))
        })
        .collect()
}
