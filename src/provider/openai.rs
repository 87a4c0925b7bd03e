//! OpenAI Chat Completions API provider.
//!
//! Also serves compatible hosts (GLM, MiniMax, DeepSeek). Tool-call arguments
//! travel as JSON strings; reasoning text is read from `reasoning_content` or
//! `reasoning_details` and written back as `reasoning_details`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ProviderError;
use crate::types::*;

use super::http::{bearer_headers, post_json, sse_data_stream};
use super::{decode_arguments, DeltaStream, ModelProvider, ProviderRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const OFFICIAL_HOST: &str = "api.openai.com";
const GLM_HOSTS: [&str; 2] = ["bigmodel.cn", "z.ai"];

pub struct OpenAiProvider {
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(model: impl Into<String>, api_key: String, base_url: Option<String>) -> Self {
        Self {
            model: model.into(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn is_glm(&self) -> bool {
        GLM_HOSTS.iter().any(|host| self.base_url.contains(host))
    }

    pub(crate) fn build_request_body(&self, request: &ProviderRequest<'_>, stream: bool) -> Value {
        // The official API rejects the reasoning field; compatible hosts use it.
        let send_reasoning = !self.base_url.contains(OFFICIAL_HOST);
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| message_to_openai(m, send_reasoning))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        let Some(obj) = body.as_object_mut() else {
            return body;
        };

        if stream {
            obj.insert("stream_options".into(), json!({ "include_usage": true }));
        }
        if let Some(max) = request.settings.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = request.settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = request.settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if self.is_glm() && request.settings.thinking_budget.is_some() {
            obj.insert("thinking".into(), json!({ "type": "enabled" }));
        }
        if !request.tools.is_empty() {
            let tool_defs: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        body
    }
}

fn message_to_openai(msg: &Message, send_reasoning: bool) -> Value {
    match msg.role {
        Role::System => json!({ "role": "system", "content": msg.content }),
        Role::User => json!({ "role": "user", "content": msg.content }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.content,
        }),
        Role::Assistant => {
            let mut out = json!({ "role": "assistant", "content": msg.content });
            if !msg.tool_calls.is_empty() {
                if msg.content.is_empty() {
                    out["content"] = Value::Null;
                }
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.tool_name,
                                "arguments": call.arguments_value().to_string(),
                            }
                        })
                    })
                    .collect();
                out["tool_calls"] = calls.into();
            }
            if let Some(thinking) = msg.thinking.as_deref().filter(|t| send_reasoning && !t.is_empty()) {
                out["reasoning_details"] = json!([{ "text": thinking }]);
            }
            out
        }
    }
}

fn usage_from(u: &OpenAiUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: if u.total_tokens > 0 {
            u.total_tokens
        } else {
            u.prompt_tokens + u.completion_tokens
        },
    }
}

fn reasoning_text(content: Option<String>, details: Option<Vec<ReasoningDetail>>) -> String {
    let mut text = content.unwrap_or_default();
    for detail in details.unwrap_or_default() {
        if let Some(t) = detail.text {
            text.push_str(&t);
        }
    }
    text
}

/// Decode a non-streaming Chat Completions answer.
pub(crate) fn parse_response(body: Value) -> Result<LlmResponse, ProviderError> {
    let data: OpenAiChatResponse = serde_json::from_value(body)?;
    let choice = data
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::malformed("no choices in response"))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| -> Result<ToolCall, ProviderError> {
            let arguments = decode_arguments(&tc.function.name, &tc.function.arguments)?;
            Ok(ToolCall::new(tc.id, tc.function.name, arguments))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let thinking = reasoning_text(
        choice.message.reasoning_content,
        choice.message.reasoning_details,
    );
    let finish_reason = choice
        .finish_reason
        .as_deref()
        .and_then(FinishReason::from_wire)
        .unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

    Ok(LlmResponse {
        content: choice.message.content.unwrap_or_default(),
        thinking: (!thinking.is_empty()).then_some(thinking),
        tool_calls,
        finish_reason,
        usage: data.usage.as_ref().map(usage_from).unwrap_or_default(),
        ..Default::default()
    })
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for Chat Completions stream chunks.
///
/// Tool calls arrive as indexed fragments and are emitted once the stream ends.
#[derive(Debug, Default)]
pub(crate) struct StreamDecoder {
    calls: BTreeMap<u64, PendingCall>,
}

impl StreamDecoder {
    pub(crate) fn push(&mut self, data: &str) -> Result<Vec<StreamDelta>, ProviderError> {
        let chunk: OpenAiStreamChunk = serde_json::from_str(data)?;
        let mut deltas = Vec::new();

        if let Some(choice) = chunk.choices.into_iter().next() {
            let delta = choice.delta;
            let reasoning = reasoning_text(delta.reasoning_content, delta.reasoning_details);
            if !reasoning.is_empty() {
                deltas.push(StreamDelta::Thinking(reasoning));
            }
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                deltas.push(StreamDelta::Text(text));
            }
            for fragment in delta.tool_calls.unwrap_or_default() {
                let pending = self.calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id {
                    pending.id = id;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        pending.name = name;
                    }
                    if let Some(args) = function.arguments {
                        pending.arguments.push_str(&args);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason.as_deref().and_then(FinishReason::from_wire) {
                deltas.push(StreamDelta::Finish(reason));
            }
        }
        if let Some(usage) = chunk.usage.as_ref() {
            deltas.push(StreamDelta::Usage(usage_from(usage)));
        }

        Ok(deltas)
    }

    /// Emit the assembled tool calls, in index order.
    pub(crate) fn finish(self) -> Result<Vec<StreamDelta>, ProviderError> {
        self.calls
            .into_values()
            .map(|pending| {
                if pending.id.is_empty() || pending.name.is_empty() {
                    return Err(ProviderError::malformed("streamed tool call without id or name"));
                }
                let arguments = decode_arguments(&pending.name, &pending.arguments)?;
                Ok(StreamDelta::ToolCall(ToolCall::new(
                    pending.id,
                    pending.name,
                    arguments,
                )))
            })
            .collect()
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ProviderRequest<'_>) -> Result<LlmResponse, ProviderError> {
        let body = self.build_request_body(request, false);
        debug!(model = %self.model, messages = request.messages.len(), "OpenAI generate");

        let resp = post_json(&self.url(), bearer_headers(&self.api_key), &body).await?;
        let data: Value = resp.json().await?;
        parse_response(data)
    }

    async fn stream(&self, request: &ProviderRequest<'_>) -> Result<DeltaStream, ProviderError> {
        let body = self.build_request_body(request, true);
        debug!(model = %self.model, messages = request.messages.len(), "OpenAI stream");

        let resp = post_json(&self.url(), bearer_headers(&self.api_key), &body).await?;
        let mut chunks = sse_data_stream(resp);

        let stream = async_stream::stream! {
            let mut decoder = StreamDecoder::default();
            let mut failed = false;
            while let Some(data) = chunks.next().await {
                let decoded = match data {
                    Ok(data) => decoder.push(&data),
                    Err(e) => Err(e),
                };
                match decoded {
                    Ok(deltas) => {
                        for delta in deltas {
                            yield Ok(delta);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                match decoder.finish() {
                    Ok(calls) => {
                        for call in calls {
                            yield Ok(call);
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// OpenAI API response types (internal)

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning_details: Option<Vec<ReasoningDetail>>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct ReasoningDetail {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning_details: Option<Vec<ReasoningDetail>>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallFragment>>,
}

#[derive(Deserialize)]
struct OpenAiToolCallFragment {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionFragment>,
}

#[derive(Deserialize)]
struct OpenAiFunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
