//! Model provider trait and backend adapters.
//!
//! Each adapter owns its wire mapping: how system prompts, tool results and
//! thinking text are placed, and how tool schemas are encoded. The agent loop
//! only sees [`ModelProvider`].

pub mod http;

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "openai")]
pub mod openai;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::RuntimeConfig;
use crate::error::{ProviderError, TillerError};
use crate::types::{GenerationSettings, LlmResponse, Message, ResponseAccumulator, StreamDelta};

/// Boxed stream of decoded deltas.
pub type DeltaStream = BoxStream<'static, Result<StreamDelta, ProviderError>>;

/// A read-only view of what to send to the backend.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
    pub settings: &'a GenerationSettings,
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
}

/// Core trait implemented by all model providers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name (e.g., "anthropic", "openai").
    fn provider_name(&self) -> &str;
    /// The model ID this provider instance serves.
    fn model_id(&self) -> &str;

    /// Generate a complete response.
    async fn generate(&self, request: &ProviderRequest<'_>) -> Result<LlmResponse, ProviderError>;

    /// Generate a response as a stream of deltas.
    ///
    /// The default runs [`generate`](Self::generate) and replays the result.
    async fn stream(&self, request: &ProviderRequest<'_>) -> Result<DeltaStream, ProviderError> {
        let response = self.generate(request).await?;
        let deltas = response_into_deltas(response).into_iter().map(Ok);
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

/// Drain a delta stream into one response, handing every delta to `on_delta`.
pub async fn collect_stream(
    mut stream: DeltaStream,
    mut on_delta: impl FnMut(&StreamDelta) + Send,
) -> Result<LlmResponse, ProviderError> {
    let mut acc = ResponseAccumulator::new();
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        on_delta(&delta);
        acc.push(delta);
    }
    Ok(acc.finish())
}

fn response_into_deltas(response: LlmResponse) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    if let Some(thinking) = response.thinking.filter(|t| !t.is_empty()) {
        deltas.push(StreamDelta::Thinking(thinking));
    }
    if let Some(signature) = response.thinking_signature {
        deltas.push(StreamDelta::ThinkingSignature(signature));
    }
    deltas.extend(
        response
            .redacted_thinking
            .into_iter()
            .map(StreamDelta::RedactedThinking),
    );
    if !response.content.is_empty() {
        deltas.push(StreamDelta::Text(response.content));
    }
    deltas.extend(response.tool_calls.into_iter().map(StreamDelta::ToolCall));
    deltas.push(StreamDelta::Usage(response.usage));
    deltas.push(StreamDelta::Finish(response.finish_reason));
    deltas
}

/// Backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderKind {
    /// Anthropic Messages API (and compatible hosts).
    Anthropic,
    /// OpenAI Chat Completions API (and compatible hosts: GLM, MiniMax, DeepSeek).
    OpenAi,
}

const MINIMAX_HOSTS: [&str; 2] = ["api.minimax.io", "api.minimaxi.com"];

/// Append the path MiniMax expects for the chosen API family.
pub fn normalize_base_url(base_url: &str, kind: ProviderKind) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if !MINIMAX_HOSTS.iter().any(|host| trimmed.contains(host)) {
        return trimmed.to_string();
    }
    let root = trimmed.replace("/anthropic", "").replace("/v1", "");
    match kind {
        ProviderKind::Anthropic => format!("{root}/anthropic/v1"),
        ProviderKind::OpenAi => format!("{root}/v1"),
    }
}

/// A named backend: the adapter family it speaks and its default endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub kind: ProviderKind,
    pub default_base_url: &'static str,
}

/// Backends reachable by name. Keys and base URL overrides live under the
/// preset's name in [`RuntimeConfig`].
pub const PROVIDER_PRESETS: [ProviderPreset; 5] = [
    ProviderPreset {
        name: "anthropic",
        kind: ProviderKind::Anthropic,
        default_base_url: "https://api.anthropic.com/v1",
    },
    ProviderPreset {
        name: "openai",
        kind: ProviderKind::OpenAi,
        default_base_url: "https://api.openai.com/v1",
    },
    ProviderPreset {
        name: "deepseek",
        kind: ProviderKind::OpenAi,
        default_base_url: "https://api.deepseek.com/v1",
    },
    ProviderPreset {
        name: "glm",
        kind: ProviderKind::OpenAi,
        default_base_url: "https://open.bigmodel.cn/api/coding/paas/v4",
    },
    ProviderPreset {
        name: "minimax",
        kind: ProviderKind::OpenAi,
        default_base_url: "https://api.minimax.io/v1",
    },
];

pub fn provider_preset(name: &str) -> Option<&'static ProviderPreset> {
    PROVIDER_PRESETS
        .iter()
        .find(|preset| preset.name.eq_ignore_ascii_case(name))
}

/// What a provider name resolves to once credentials are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTarget {
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: String,
}

/// Resolve `name` against the presets and the keys and URLs in `config`.
pub fn resolve_provider(name: &str, config: &RuntimeConfig) -> Result<ProviderTarget, TillerError> {
    let preset = provider_preset(name)
        .ok_or_else(|| TillerError::Configuration(format!("unknown provider {name}")))?;
    let api_key = config.get_api_key(preset.name).ok_or_else(|| {
        TillerError::Configuration(format!("missing API key for {}", preset.name))
    })?;
    let base_url = config
        .get_base_url(preset.name)
        .unwrap_or_else(|| preset.default_base_url.to_string());

    Ok(ProviderTarget {
        kind: preset.kind,
        api_key,
        base_url: normalize_base_url(&base_url, preset.kind),
    })
}

/// Create the adapter for `kind`, reading the key and base URL from `config`
/// under the kind's name ("anthropic", "openai").
pub fn create_provider(
    kind: ProviderKind,
    model: &str,
    config: &RuntimeConfig,
) -> Result<Box<dyn ModelProvider>, TillerError> {
    create_named_provider(&kind.to_string(), model, config)
}

/// Create the adapter for a named backend such as "glm" or "deepseek".
pub fn create_named_provider(
    name: &str,
    model: &str,
    config: &RuntimeConfig,
) -> Result<Box<dyn ModelProvider>, TillerError> {
    let target = resolve_provider(name, config)?;
    build_provider(target, model)
}

#[cfg_attr(
    not(any(feature = "anthropic", feature = "openai")),
    allow(unused_variables)
)]
fn build_provider(
    target: ProviderTarget,
    model: &str,
) -> Result<Box<dyn ModelProvider>, TillerError> {
    match target.kind {
        #[cfg(feature = "anthropic")]
        ProviderKind::Anthropic => Ok(Box::new(anthropic::AnthropicProvider::new(
            model,
            target.api_key,
            Some(target.base_url),
        ))),
        #[cfg(feature = "openai")]
        ProviderKind::OpenAi => Ok(Box::new(openai::OpenAiProvider::new(
            model,
            target.api_key,
            Some(target.base_url),
        ))),
        #[allow(unreachable_patterns)]
        _ => Err(TillerError::Configuration(format!(
            "provider {} is not compiled in",
            target.kind
        ))),
    }
}

/// Parse a JSON object carried as a string (tool-call arguments on the wire).
///
/// An empty string means no arguments. Anything that is not a JSON object is
/// a [`ProviderError`] of kind `Malformed`.
pub(crate) fn decode_arguments(
    tool_name: &str,
    raw: &str,
) -> Result<crate::types::ArgumentMap, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(crate::types::ArgumentMap::new());
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(ProviderError::malformed(format!(
            "arguments for tool '{tool_name}' are not an object: {other}"
        ))),
        Err(e) => Err(ProviderError::malformed(format!(
            "arguments for tool '{tool_name}' are not valid JSON: {e}"
        ))
        .with_source(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::types::{FinishReason, ToolCall, TokenUsage};

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!("OpenAI".parse::<ProviderKind>().ok(), Some(ProviderKind::OpenAi));
        assert_eq!("anthropic".parse::<ProviderKind>().ok(), Some(ProviderKind::Anthropic));
        assert!("gemini".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn minimax_urls_get_family_suffix() {
        assert_eq!(
            normalize_base_url("https://api.minimax.io/v1", ProviderKind::Anthropic),
            "https://api.minimax.io/anthropic/v1"
        );
        assert_eq!(
            normalize_base_url("https://api.minimaxi.com/anthropic/", ProviderKind::OpenAi),
            "https://api.minimaxi.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://open.bigmodel.cn/api/paas/v4/", ProviderKind::OpenAi),
            "https://open.bigmodel.cn/api/paas/v4"
        );
    }

    #[test]
    fn decode_arguments_rejects_non_objects() {
        assert!(decode_arguments("calc", "").unwrap().is_empty());
        assert_eq!(
            decode_arguments("calc", r#"{"expression":"2+2"}"#).unwrap()["expression"],
            "2+2"
        );
        let err = decode_arguments("calc", "[1,2]").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Malformed);
        let err = decode_arguments("calc", "{\"expression\":").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Malformed);
    }

    #[test]
    fn create_provider_requires_a_key() {
        let config = RuntimeConfig::new();
        let result = create_provider(ProviderKind::Anthropic, "claude", &config);
        assert!(matches!(result, Err(TillerError::Configuration(_))));
    }

    #[test]
    fn glm_key_resolves_to_an_openai_compatible_target() {
        let config = RuntimeConfig::new();
        config.set_api_key("glm", "glm-key");

        let target = resolve_provider("GLM", &config).unwrap();

        assert_eq!(target.kind, ProviderKind::OpenAi);
        assert_eq!(target.api_key, "glm-key");
        assert!(target.base_url.contains("open.bigmodel.cn"));
        assert!(matches!(
            resolve_provider("deepseek", &config),
            Err(TillerError::Configuration(_))
        ));
        assert!(matches!(
            resolve_provider("gemini", &config),
            Err(TillerError::Configuration(_))
        ));
    }

    #[test]
    fn minimax_override_is_normalized() {
        let config = RuntimeConfig::new();
        config.set_api_key("minimax", "mm-key");
        config.set_base_url("minimax", "https://api.minimaxi.com/anthropic");

        let target = resolve_provider("minimax", &config).unwrap();

        assert_eq!(target.base_url, "https://api.minimaxi.com/v1");
    }

    #[cfg(feature = "openai")]
    #[test]
    fn named_provider_builds_the_preset_family() {
        let config = RuntimeConfig::new();
        config.set_api_key("deepseek", "ds-key");

        let provider = create_named_provider("deepseek", "deepseek-chat", &config).unwrap();

        assert_eq!(provider.provider_name(), "openai");
        assert_eq!(provider.model_id(), "deepseek-chat");
    }

    #[tokio::test]
    async fn collect_stream_replays_a_whole_response() {
        let response = LlmResponse {
            content: "hi".into(),
            thinking: Some("hmm".into()),
            tool_calls: vec![ToolCall::new("c1", "calc", Default::default())],
            finish_reason: FinishReason::ToolCalls,
            usage: TokenUsage::new(3, 4),
            ..Default::default()
        };
        let stream: DeltaStream = Box::pin(futures::stream::iter(
            response_into_deltas(response.clone()).into_iter().map(Ok),
        ));
        let mut seen = 0;
        let collected = collect_stream(stream, |_| seen += 1).await.unwrap();
        assert_eq!(collected, response);
        assert_eq!(seen, 5);
    }
}
