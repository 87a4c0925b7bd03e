//! HTTP behaviour of the provider adapters against a mock server.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tiller::config::RuntimeConfig;
use tiller::error::ProviderErrorKind;
use tiller::provider::anthropic::AnthropicProvider;
use tiller::provider::openai::OpenAiProvider;
use tiller::provider::{
    collect_stream, create_named_provider, ModelProvider, ProviderRequest, ToolDefinition,
};
use tiller::types::{FinishReason, GenerationSettings, Message, StreamDelta};

fn conversation() -> Vec<Message> {
    vec![Message::system("be terse"), Message::user("compute 2+2")]
}

fn calculator_definition() -> Vec<ToolDefinition> {
    vec![ToolDefinition {
        name: "calculator".into(),
        description: "Evaluate a sum".into(),
        parameters: json!({
            "type": "object",
            "properties": { "expression": { "type": "string" } },
            "required": ["expression"]
        }),
    }]
}

fn anthropic(server: &MockServer) -> AnthropicProvider {
    AnthropicProvider::new("claude-test", "test-key".to_string(), Some(server.uri()))
}

fn openai(server: &MockServer) -> OpenAiProvider {
    OpenAiProvider::new("gpt-test", "test-key".to_string(), Some(server.uri()))
}

#[tokio::test]
async fn anthropic_generate_decodes_tool_use() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "test-key"))
        .and(body_partial_json(json!({
            "model": "claude-test",
            "system": "be terse",
            "tools": [{ "name": "calculator" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                { "type": "text", "text": "Let me compute." },
                { "type": "tool_use", "id": "toolu_1", "name": "calculator",
                  "input": { "expression": "2+2" } }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 20, "output_tokens": 7 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let messages = conversation();
    let tools = calculator_definition();
    let settings = GenerationSettings::default();
    let request = ProviderRequest {
        messages: &messages,
        tools: &tools,
        settings: &settings,
    };

    let response = anthropic(&server).generate(&request).await.unwrap();

    assert_eq!(response.content, "Let me compute.");
    assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    assert_eq!(response.tool_calls[0].id, "toolu_1");
    assert_eq!(response.tool_calls[0].arguments["expression"], "2+2");
    assert_eq!(response.usage.total_tokens, 27);
}

#[tokio::test]
async fn anthropic_stream_emits_deltas_and_collects_usage() {
    let server = MockServer::start().await;
    let sse = [
        json!({ "type": "message_start", "message": { "usage": { "input_tokens": 10 } } }),
        json!({ "type": "content_block_start", "index": 0, "content_block": { "type": "text", "text": "" } }),
        json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": "The answer " } }),
        json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": "is 4" } }),
        json!({ "type": "content_block_stop", "index": 0 }),
        json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" }, "usage": { "output_tokens": 5 } }),
        json!({ "type": "message_stop" }),
    ]
    .iter()
    .map(|event| format!("event: {}\ndata: {event}\n\n", event["type"].as_str().unwrap()))
    .collect::<String>();
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(body_partial_json(json!({ "stream": true })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .mount(&server)
        .await;

    let messages = conversation();
    let settings = GenerationSettings::default();
    let request = ProviderRequest {
        messages: &messages,
        tools: &[],
        settings: &settings,
    };

    let stream = anthropic(&server).stream(&request).await.unwrap();
    let mut texts = Vec::new();
    let response = collect_stream(stream, |delta| {
        if let StreamDelta::Text(text) = delta {
            texts.push(text.clone());
        }
    })
    .await
    .unwrap();

    assert_eq!(texts, vec!["The answer ", "is 4"]);
    assert_eq!(response.content, "The answer is 4");
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.usage.prompt_tokens, 10);
    assert_eq!(response.usage.completion_tokens, 5);
}

#[tokio::test]
async fn openai_generate_decodes_string_arguments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-test",
            "messages": [{ "role": "system", "content": "be terse" }],
            "tools": [{ "type": "function", "function": { "name": "calculator" } }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "calculator", "arguments": "{\"expression\":\"2+2\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let messages = conversation();
    let tools = calculator_definition();
    let settings = GenerationSettings::default();
    let request = ProviderRequest {
        messages: &messages,
        tools: &tools,
        settings: &settings,
    };

    let response = openai(&server).generate(&request).await.unwrap();

    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].arguments["expression"], "2+2");
    assert!(response.usage.is_zero());
}

#[tokio::test]
async fn openai_bad_arguments_are_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "calculator", "arguments": "{\"expression\": " }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let messages = conversation();
    let settings = GenerationSettings::default();
    let request = ProviderRequest {
        messages: &messages,
        tools: &[],
        settings: &settings,
    };

    let err = openai(&server).generate(&request).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::Malformed);
}

#[tokio::test]
async fn http_statuses_map_to_error_kinds() {
    let cases = [
        (429, ProviderErrorKind::RateLimited),
        (401, ProviderErrorKind::Authentication),
        (403, ProviderErrorKind::Authentication),
        (500, ProviderErrorKind::Transport),
        (503, ProviderErrorKind::Transport),
        (400, ProviderErrorKind::InvalidRequest),
    ];
    let messages = conversation();
    let settings = GenerationSettings::default();
    let request = ProviderRequest {
        messages: &messages,
        tools: &[],
        settings: &settings,
    };

    for (status, kind) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_string("{\"error\":{}}"))
            .mount(&server)
            .await;

        let err = anthropic(&server).generate(&request).await.unwrap_err();
        assert_eq!(err.kind, kind, "anthropic status {status}");
        assert_eq!(err.status, Some(status));

        let err = openai(&server).generate(&request).await.unwrap_err();
        assert_eq!(err.kind, kind, "openai status {status}");
    }
}

#[tokio::test]
async fn rate_limit_honours_retry_after_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let messages = conversation();
    let settings = GenerationSettings::default();
    let request = ProviderRequest {
        messages: &messages,
        tools: &[],
        settings: &settings,
    };

    let err = openai(&server).generate(&request).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::RateLimited);
    assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn undecodable_success_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string("{not-json"),
        )
        .mount(&server)
        .await;

    let messages = conversation();
    let settings = GenerationSettings::default();
    let request = ProviderRequest {
        messages: &messages,
        tools: &[],
        settings: &settings,
    };

    let err = anthropic(&server).generate(&request).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::Malformed);
}

#[tokio::test]
async fn glm_key_drives_the_chat_completions_adapter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer glm-key"))
        .and(body_partial_json(json!({ "model": "GLM-4.7" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "role": "assistant", "content": "4" },
                "finish_reason": "stop"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = RuntimeConfig::new();
    config.set_api_key("glm", "glm-key");
    config.set_base_url("glm", server.uri());
    let provider = create_named_provider("glm", "GLM-4.7", &config).unwrap();

    let messages = conversation();
    let settings = GenerationSettings::default();
    let request = ProviderRequest {
        messages: &messages,
        tools: &[],
        settings: &settings,
    };
    let response = provider.generate(&request).await.unwrap();

    assert_eq!(response.content, "4");
}
