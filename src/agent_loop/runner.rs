//! The agent loop: ask the model, run the requested tools, repeat.

use std::sync::Arc;

use bon::bon;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::compaction::{estimate_tokens, ProviderSummarizer, Summarizer, TokenBudget};
use super::events::{AgentEvent, AgentEventSink, RunEventEmitter};
use super::types::{LoopOutcome, LoopStats, LoopStatus, SessionId, TRUNCATION_MARKER};
use crate::config::AgentConfig;
use crate::error::{ProviderError, SummarizationError, TillerError};
use crate::provider::{collect_stream, ModelProvider, ProviderRequest, ToolDefinition};
use crate::tools::{DispatchEvent, ToolDispatcher, ToolRegistry};
use crate::types::{
    validate_history, GenerationSettings, LlmResponse, Message, Role, StreamDelta, TokenUsage,
};
use crate::util::timeout::with_timeout;

/// Drives one conversation. Each [`run`](Self::run) is one task; the history
/// carries over between runs until [`reset`](Self::reset).
pub struct AgentLoop {
    session_id: SessionId,
    provider: Arc<dyn ModelProvider>,
    dispatcher: ToolDispatcher,
    tool_definitions: Vec<ToolDefinition>,
    summarizer: Arc<dyn Summarizer>,
    config: AgentConfig,
    settings: GenerationSettings,
    messages: Vec<Message>,
    budget: TokenBudget,
    cumulative_usage: TokenUsage,
    emitter: RunEventEmitter,
}

/// Counters of the task in progress.
#[derive(Default)]
struct TaskState {
    steps: usize,
    usage: TokenUsage,
}

struct Termination {
    status: LoopStatus,
    final_content: Option<String>,
    error: Option<TillerError>,
}

impl Termination {
    fn new(status: LoopStatus) -> Self {
        Self {
            status,
            final_content: None,
            error: None,
        }
    }
}

#[bon]
impl AgentLoop {
    #[builder]
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        #[builder(into)] system_prompt: String,
        tools: Option<Arc<ToolRegistry>>,
        #[builder(default)] config: AgentConfig,
        event_sink: Option<AgentEventSink>,
        // defaults to asking `provider` under the configured retry policy
        summarizer: Option<Arc<dyn Summarizer>>,
        session_id: Option<SessionId>,
    ) -> Self {
        let session_id = session_id.unwrap_or_else(Uuid::new_v4);
        let registry = tools.unwrap_or_default();
        let tool_definitions = registry.definitions();
        let dispatcher = ToolDispatcher::new(registry)
            .parallel(config.parallel_tools)
            .tool_timeout(config.tool_timeout)
            .cancel_grace(config.cancel_grace);
        let summarizer = summarizer.unwrap_or_else(|| {
            Arc::new(ProviderSummarizer::new(
                provider.clone(),
                config.retry.clone(),
                config.provider_timeout,
            ))
        });
        let settings = GenerationSettings {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: None,
            thinking_budget: config.enable_thinking.then_some(config.thinking_budget),
        };

        Self {
            session_id,
            provider,
            dispatcher,
            tool_definitions,
            summarizer,
            budget: TokenBudget::new(config.token_limit),
            settings,
            messages: vec![Message::system(system_prompt)],
            cumulative_usage: TokenUsage::default(),
            emitter: RunEventEmitter::new(session_id, event_sink),
            config,
        }
    }
}

impl AgentLoop {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Current history, system message first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Drop everything but the system message and zero the counters.
    pub fn reset(&mut self) {
        self.messages.truncate(1);
        self.budget.clear();
        self.cumulative_usage = TokenUsage::default();
        info!(session_id = %self.session_id, "session reset");
    }

    pub fn stats(&self) -> LoopStats {
        LoopStats {
            session_id: self.session_id,
            message_count: self.messages.len(),
            estimated_tokens: estimate_tokens(&self.messages),
            last_usage: self.budget.last_reported().copied(),
            cumulative_usage: self.cumulative_usage,
            tool_count: self.tool_definitions.len(),
            parallel_tools: self.config.parallel_tools,
            enable_thinking: self.config.enable_thinking,
        }
    }

    /// Append `user_input` and drive the loop until it stops.
    ///
    /// Never panics or returns early on tool or summarization failures; only
    /// provider failures end a task in [`LoopStatus::Failed`].
    pub async fn run(
        &mut self,
        user_input: impl Into<String>,
        cancel: &CancellationToken,
    ) -> LoopOutcome {
        let user_input = user_input.into();
        info!(
            session_id = %self.session_id,
            model = self.provider.model_id(),
            max_steps = self.config.max_steps,
            "agent run started"
        );
        self.emitter.emit(AgentEvent::AgentStarted {
            user_input: user_input.clone(),
        });
        self.messages.push(Message::user(user_input));

        let mut task = TaskState::default();
        let end = self.drive(cancel, &mut task).await;

        match &end.error {
            Some(err) => error!(session_id = %self.session_id, steps = task.steps, error = %err, "agent run failed"),
            None => info!(session_id = %self.session_id, steps = task.steps, status = %end.status, "agent run finished"),
        }
        self.emitter.emit(AgentEvent::AgentFinished {
            status: end.status,
            steps: task.steps,
        });

        LoopOutcome {
            status: end.status,
            messages: self.messages.clone(),
            final_content: end.final_content,
            steps: task.steps,
            usage: task.usage,
            error: end.error,
            finished_at: Utc::now(),
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken, task: &mut TaskState) -> Termination {
        loop {
            if cancel.is_cancelled() {
                return self.cancelled();
            }
            if task.steps >= self.config.max_steps {
                warn!(max_steps = self.config.max_steps, "step limit reached");
                return self.max_steps_reached();
            }
            task.steps += 1;
            let step = task.steps;
            self.emitter.emit(AgentEvent::TurnStarted { step });
            debug!(step, messages = self.messages.len(), "step started");

            match self.enforce_budget(cancel).await {
                Ok(()) => {}
                Err(SummarizationError::Cancelled) => return self.cancelled(),
                Err(err) => warn!(error = %err, "summarization failed, history kept as is"),
            }
            self.check_history();

            let response = match self.call_model(cancel).await {
                Ok(response) => response,
                Err(TillerError::Cancelled) => return self.cancelled(),
                Err(err) => {
                    self.emitter.emit(AgentEvent::TurnEnded {
                        step,
                        tool_calls: 0,
                    });
                    return Termination {
                        error: Some(err),
                        ..Termination::new(LoopStatus::Failed)
                    };
                }
            };
            self.record_usage(task, &response.usage);

            self.messages.push(Message::from_response(&response));
            self.check_history();
            if !response.has_tool_calls() {
                self.emitter.emit(AgentEvent::TurnEnded {
                    step,
                    tool_calls: 0,
                });
                return Termination {
                    final_content: Some(response.content),
                    ..Termination::new(LoopStatus::Done)
                };
            }

            let calls = response.tool_calls;
            debug!(step, tool_calls = calls.len(), "dispatching tools");
            let emitter = &self.emitter;
            let on_event = |event: DispatchEvent<'_>| forward_dispatch_event(emitter, step, event);
            let outcome = self.dispatcher.dispatch(&calls, cancel, &on_event).await;

            // A turn with forced-failed calls is dropped whole by the cleanup.
            if outcome.all_completed() {
                self.messages.extend(outcome.to_messages(&calls));
            }
            self.check_history();
            self.emitter.emit(AgentEvent::TurnEnded {
                step,
                tool_calls: calls.len(),
            });

            if outcome.cancelled || cancel.is_cancelled() {
                return self.cancelled();
            }
        }
    }

    async fn enforce_budget(&mut self, cancel: &CancellationToken) -> Result<(), SummarizationError> {
        self.emitter.emit(AgentEvent::TokenUpdate {
            estimated: estimate_tokens(&self.messages),
            reported: self.budget.last_reported().copied(),
            limit: self.budget.limit(),
        });

        let report = self
            .budget
            .compact(&mut self.messages, self.summarizer.as_ref(), cancel)
            .await?;
        if let Some(report) = report {
            self.emitter.emit(AgentEvent::HistorySummarized {
                runs: report.runs,
                tokens_before: report.tokens_before,
                tokens_after: report.tokens_after,
            });
        }
        Ok(())
    }

    /// One model call through retry and timeout, abandoned on cancellation.
    async fn call_model(&self, cancel: &CancellationToken) -> Result<LlmResponse, TillerError> {
        let request = ProviderRequest {
            messages: &self.messages,
            tools: &self.tool_definitions,
            settings: &self.settings,
        };
        let timeout = self.config.provider_timeout;
        let call = self
            .config
            .retry
            .execute(|| with_timeout(timeout, self.request_once(&request)));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("provider call abandoned on cancellation");
                Err(TillerError::Cancelled)
            }
            result = call => result,
        }
    }

    async fn request_once(&self, request: &ProviderRequest<'_>) -> Result<LlmResponse, ProviderError> {
        if !self.config.stream {
            return self.provider.generate(request).await;
        }
        let stream = self.provider.stream(request).await?;
        let emitter = &self.emitter;
        collect_stream(stream, |delta| {
            if !emitter.is_active() {
                return;
            }
            match delta {
                StreamDelta::Text(text) => emitter.emit(AgentEvent::AssistantDelta { text: text.clone() }),
                StreamDelta::Thinking(text) => emitter.emit(AgentEvent::ThinkingDelta { text: text.clone() }),
                _ => {}
            }
        })
        .await
    }

    fn record_usage(&mut self, task: &mut TaskState, usage: &TokenUsage) {
        if usage.is_zero() {
            return;
        }
        task.usage.merge(usage);
        self.cumulative_usage.merge(usage);
        self.budget.record_usage(usage);
        self.emitter.emit(AgentEvent::TokenUpdate {
            estimated: estimate_tokens(&self.messages),
            reported: Some(*usage),
            limit: self.budget.limit(),
        });
    }

    fn cancelled(&mut self) -> Termination {
        let removed = self.drop_incomplete_turn();
        self.check_history();
        warn!(session_id = %self.session_id, removed, "agent run cancelled");
        Termination::new(LoopStatus::Cancelled)
    }

    fn check_history(&self) {
        debug_assert!(
            validate_history(&self.messages).is_ok(),
            "history invariant broken: {:?}",
            validate_history(&self.messages)
        );
    }

    /// Remove a trailing assistant turn whose tool results are not all
    /// present, along with the partial results. Returns the messages removed.
    fn drop_incomplete_turn(&mut self) -> usize {
        let Some(index) = self.messages.iter().rposition(|m| m.role == Role::Assistant) else {
            return 0;
        };
        let turn = &self.messages[index];
        let answered = self.messages[index + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .count();
        if !turn.has_tool_calls() || answered >= turn.tool_calls.len() {
            return 0;
        }
        let removed = self.messages.len() - index;
        self.messages.truncate(index);
        removed
    }

    fn max_steps_reached(&self) -> Termination {
        let last = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.trim())
            .unwrap_or_default();
        let final_content = if last.is_empty() {
            TRUNCATION_MARKER.to_string()
        } else {
            format!("{last}\n\n{TRUNCATION_MARKER}")
        };
        Termination {
            final_content: Some(final_content),
            ..Termination::new(LoopStatus::MaxStepsReached)
        }
    }
}

fn forward_dispatch_event(emitter: &RunEventEmitter, step: usize, event: DispatchEvent<'_>) {
    match event {
        DispatchEvent::Started { index, call } => emitter.emit(AgentEvent::ToolStarted {
            step,
            index,
            call: call.clone(),
        }),
        DispatchEvent::Finished {
            index,
            call,
            result,
            duration,
            completed,
        } => emitter.emit(AgentEvent::ToolCompleted {
            step,
            index,
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            result: result.clone(),
            duration_ms: duration.as_millis() as u64,
            completed,
        }),
    }
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("session_id", &self.session_id)
            .field("provider", &self.provider.provider_name())
            .field("model", &self.provider.model_id())
            .field("messages", &self.messages.len())
            .finish_non_exhaustive()
    }
}
