//! Anthropic Messages API provider.
//!
//! System text goes to the top-level `system` field. Tool results travel as
//! `tool_result` blocks inside a user message; consecutive results are merged
//! into one message because the API requires strict role alternation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ProviderError, ProviderErrorKind};
use crate::types::*;

use super::http::{anthropic_headers, post_json, sse_data_stream};
use super::{decode_arguments, DeltaStream, ModelProvider, ProviderRequest};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    model: String,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(model: impl Into<String>, api_key: String, base_url: Option<String>) -> Self {
        Self {
            model: model.into(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn url(&self) -> String {
        format!("{}/messages", self.base_url.trim_end_matches('/'))
    }

    pub(crate) fn build_request_body(&self, request: &ProviderRequest<'_>, stream: bool) -> Value {
        let thinking_budget = request.settings.thinking_budget;
        let mut system_parts = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for msg in request.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.as_str()),
                Role::User => messages.push(json!({
                    "role": "user",
                    "content": msg.content,
                })),
                Role::Assistant => messages.push(assistant_message(msg, thinking_budget.is_some())),
                Role::Tool => {
                    let mut block = json!({
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id,
                        "content": msg.content,
                    });
                    if msg.is_error {
                        block["is_error"] = true.into();
                    }
                    if messages.last().is_some_and(is_tool_result_message) {
                        if let Some(blocks) = messages
                            .last_mut()
                            .and_then(|last| last["content"].as_array_mut())
                        {
                            blocks.push(block);
                        }
                    } else {
                        messages.push(json!({ "role": "user", "content": [block] }));
                    }
                }
            }
        }

        let max_tokens = match thinking_budget {
            Some(budget) => request
                .settings
                .max_tokens
                .unwrap_or(0)
                .max(budget + DEFAULT_MAX_TOKENS),
            None => request.settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        };

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": stream,
        });
        let Some(obj) = body.as_object_mut() else {
            return body;
        };

        if !system_parts.is_empty() {
            obj.insert("system".into(), system_parts.join("\n").into());
        }
        match thinking_budget {
            Some(budget) => {
                obj.insert(
                    "thinking".into(),
                    json!({ "type": "enabled", "budget_tokens": budget }),
                );
            }
            // Temperature is rejected while thinking is enabled.
            None => {
                if let Some(temp) = request.settings.temperature {
                    obj.insert("temperature".into(), temp.into());
                }
            }
        }
        if let Some(top_p) = request.settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if !request.tools.is_empty() {
            let tool_defs: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        body
    }
}

fn assistant_message(msg: &Message, send_thinking: bool) -> Value {
    let mut blocks = Vec::new();
    if send_thinking {
        // Unsigned thinking cannot be replayed, so it is left out.
        if let (Some(thinking), Some(signature)) = (&msg.thinking, &msg.thinking_signature) {
            blocks.push(json!({
                "type": "thinking",
                "thinking": thinking,
                "signature": signature,
            }));
        }
        for data in &msg.redacted_thinking {
            blocks.push(json!({ "type": "redacted_thinking", "data": data }));
        }
    }
    if blocks.is_empty() && msg.tool_calls.is_empty() {
        return json!({ "role": "assistant", "content": msg.content });
    }

    if !msg.content.is_empty() {
        blocks.push(json!({ "type": "text", "text": msg.content }));
    }
    for call in &msg.tool_calls {
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.tool_name,
            "input": call.arguments,
        }));
    }
    json!({ "role": "assistant", "content": blocks })
}

fn is_tool_result_message(message: &Value) -> bool {
    message["role"] == "user"
        && message["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .is_some_and(|block| block["type"] == "tool_result")
}

/// Decode a non-streaming Messages API answer.
pub(crate) fn parse_response(body: Value) -> Result<LlmResponse, ProviderError> {
    let data: AnthropicResponse = serde_json::from_value(body)?;

    let mut content = String::new();
    let mut thinking = String::new();
    let mut thinking_signature = None;
    let mut redacted_thinking = Vec::new();
    let mut tool_calls = Vec::new();

    for block in data.content {
        match block.r#type.as_str() {
            "text" => content.push_str(block.text.as_deref().unwrap_or_default()),
            "thinking" => {
                thinking.push_str(block.thinking.as_deref().unwrap_or_default());
                if block.signature.is_some() {
                    thinking_signature = block.signature;
                }
            }
            "redacted_thinking" => {
                if let Some(data) = block.data {
                    redacted_thinking.push(data);
                }
            }
            "tool_use" => {
                let (Some(id), Some(name)) = (block.id, block.name) else {
                    return Err(ProviderError::malformed("tool_use block without id or name"));
                };
                let arguments = match block.input {
                    None | Some(Value::Null) => ArgumentMap::new(),
                    Some(Value::Object(map)) => map,
                    Some(other) => {
                        return Err(ProviderError::malformed(format!(
                            "tool_use input for '{name}' is not an object: {other}"
                        )))
                    }
                };
                tool_calls.push(ToolCall::new(id, name, arguments));
            }
            _ => {}
        }
    }

    let finish_reason = data
        .stop_reason
        .as_deref()
        .and_then(FinishReason::from_wire)
        .unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });
    let usage = data
        .usage
        .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    Ok(LlmResponse {
        content,
        thinking: (!thinking.is_empty()).then_some(thinking),
        thinking_signature,
        redacted_thinking,
        tool_calls,
        finish_reason,
        usage,
    })
}

#[derive(Debug, Default)]
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Incremental decoder for Messages API server-sent events.
#[derive(Debug, Default)]
pub(crate) struct StreamDecoder {
    tools: BTreeMap<u64, PendingToolUse>,
}

impl StreamDecoder {
    /// Decode one SSE `data:` payload.
    pub(crate) fn push(&mut self, data: &str) -> Result<Vec<StreamDelta>, ProviderError> {
        let event: Value = serde_json::from_str(data)?;
        let index = event["index"].as_u64().unwrap_or(0);
        let mut deltas = Vec::new();

        match event["type"].as_str().unwrap_or_default() {
            "message_start" => {
                if let Some(input) = event["message"]["usage"]["input_tokens"].as_u64() {
                    deltas.push(StreamDelta::Usage(TokenUsage {
                        prompt_tokens: input as u32,
                        ..Default::default()
                    }));
                }
            }
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"] == "redacted_thinking" {
                    if let Some(data) = block["data"].as_str() {
                        deltas.push(StreamDelta::RedactedThinking(data.to_string()));
                    }
                } else if block["type"] == "tool_use" {
                    self.tools.insert(
                        index,
                        PendingToolUse {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            input_json: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            deltas.push(StreamDelta::Text(text.to_string()));
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta["thinking"].as_str() {
                            deltas.push(StreamDelta::Thinking(text.to_string()));
                        }
                    }
                    "signature_delta" => {
                        if let Some(signature) = delta["signature"].as_str() {
                            deltas.push(StreamDelta::ThinkingSignature(signature.to_string()));
                        }
                    }
                    "input_json_delta" => {
                        let pending = self.tools.get_mut(&index).ok_or_else(|| {
                            ProviderError::malformed(format!(
                                "input_json_delta for unknown block {index}"
                            ))
                        })?;
                        pending
                            .input_json
                            .push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(pending) = self.tools.remove(&index) {
                    if pending.id.is_empty() || pending.name.is_empty() {
                        return Err(ProviderError::malformed("tool_use block without id or name"));
                    }
                    let arguments = decode_arguments(&pending.name, &pending.input_json)?;
                    deltas.push(StreamDelta::ToolCall(ToolCall::new(
                        pending.id,
                        pending.name,
                        arguments,
                    )));
                }
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"]
                    .as_str()
                    .and_then(FinishReason::from_wire)
                {
                    deltas.push(StreamDelta::Finish(reason));
                }
                if let Some(output) = event["usage"]["output_tokens"].as_u64() {
                    deltas.push(StreamDelta::Usage(TokenUsage {
                        completion_tokens: output as u32,
                        ..Default::default()
                    }));
                }
            }
            "error" => {
                let kind = match event["error"]["type"].as_str() {
                    Some("rate_limit_error") => ProviderErrorKind::RateLimited,
                    Some("invalid_request_error") => ProviderErrorKind::InvalidRequest,
                    Some("authentication_error") => ProviderErrorKind::Authentication,
                    _ => ProviderErrorKind::Transport,
                };
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("stream error")
                    .to_string();
                return Err(ProviderError::new(kind, message));
            }
            _ => {}
        }

        Ok(deltas)
    }

    /// Fail if the stream ended inside a tool_use block.
    pub(crate) fn finish(&self) -> Result<(), ProviderError> {
        match self.tools.values().next() {
            Some(pending) => Err(ProviderError::malformed(format!(
                "stream ended before tool_use '{}' completed",
                pending.name
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ProviderRequest<'_>) -> Result<LlmResponse, ProviderError> {
        let body = self.build_request_body(request, false);
        debug!(model = %self.model, messages = request.messages.len(), "Anthropic generate");

        let resp = post_json(&self.url(), anthropic_headers(&self.api_key, API_VERSION), &body).await?;
        let data: Value = resp.json().await?;
        parse_response(data)
    }

    async fn stream(&self, request: &ProviderRequest<'_>) -> Result<DeltaStream, ProviderError> {
        let body = self.build_request_body(request, true);
        debug!(model = %self.model, messages = request.messages.len(), "Anthropic stream");

        let resp = post_json(&self.url(), anthropic_headers(&self.api_key, API_VERSION), &body).await?;
        let mut events = sse_data_stream(resp);

        let stream = async_stream::stream! {
            let mut decoder = StreamDecoder::default();
            let mut failed = false;
            while let Some(data) = events.next().await {
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
                if let Err(e) = decoder.finish() {
                    yield Err(e);
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// Internal Anthropic response types

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
