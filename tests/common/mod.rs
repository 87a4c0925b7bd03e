//! Shared test helpers: a scripted provider and a few tools.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use tiller::error::ProviderError;
use tiller::provider::{ModelProvider, ProviderRequest};
use tiller::tools::{AgentTool, AgentToolParameters, Tool};
use tiller::types::*;

/// What the provider saw on one call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub at: Instant,
}

struct Scripted {
    delay: Option<Duration>,
    reply: Result<LlmResponse, ProviderError>,
}

/// A provider that replays queued replies in order.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: Result<LlmResponse, ProviderError>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted { delay: None, reply });
    }

    /// Queue a reply that arrives only after `delay`.
    pub fn push_delayed(&self, delay: Duration, reply: Result<LlmResponse, ProviderError>) {
        self.script.lock().unwrap().push_back(Scripted {
            delay: Some(delay),
            reply,
        });
    }

    pub fn reply_text(&self, text: &str) {
        self.push(Ok(LlmResponse::text(text)));
    }

    pub fn reply_tool_calls(&self, calls: Vec<ToolCall>) {
        self.push(Ok(LlmResponse::tool_calls(calls)));
    }

    pub fn fail(&self, err: ProviderError) {
        self.push(Err(err));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn generate(&self, request: &ProviderRequest<'_>) -> Result<LlmResponse, ProviderError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: request.messages.to_vec(),
            tools: request.tools.iter().map(|t| t.name.clone()).collect(),
            at: Instant::now(),
        });
        let next = self.script.lock().unwrap().pop_front();
        let Some(next) = next else {
            return Err(ProviderError::invalid_request("script exhausted"));
        };
        if let Some(delay) = next.delay {
            tokio::time::sleep(delay).await;
        }
        next.reply
    }
}

pub fn call(id: &str, tool: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, tool, arguments.as_object().cloned().unwrap_or_default())
}

/// `calculator(expression)` summing `a+b+...`.
pub fn calculator() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "calculator",
        "Evaluate a sum such as 2+2",
        AgentToolParameters::object()
            .string("expression", "Arithmetic expression", true)
            .build(),
        |args, _ctx| async move {
            let expression = args.get_str("expression")?;
            let sum: Result<i64, _> = expression
                .split('+')
                .map(|term| term.trim().parse::<i64>())
                .sum();
            Ok(match sum {
                Ok(total) => ToolResult::ok(total.to_string()),
                Err(e) => ToolResult::failure(format!("cannot evaluate '{expression}': {e}")),
            })
        },
    ))
}

/// Tool that sleeps for `millis` then answers with its own name.
pub fn sleeper(name: &str, millis: u64) -> Arc<dyn Tool> {
    let reply = name.to_string();
    Arc::new(AgentTool::new(
        name,
        "sleeps, then answers",
        AgentToolParameters::empty(),
        move |_, _| {
            let reply = reply.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(ToolResult::ok(reply))
            }
        },
    ))
}

/// Tool that fires the run's cancellation token and completes normally.
pub fn interrupter() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "interrupt",
        "cancels the run",
        AgentToolParameters::empty(),
        |_, ctx| async move {
            ctx.cancel.cancel();
            Ok(ToolResult::ok("interrupted"))
        },
    ))
}

pub fn empty_args() -> Value {
    json!({})
}
