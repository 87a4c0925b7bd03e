//! Configuration (layered: code > env).
//!
//! [`RuntimeConfig`] holds provider credentials and endpoints. [`AgentConfig`]
//! holds loop behaviour; it deserializes from whatever the host application
//! loads, with a TOML entry point and environment overrides.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TillerError;
use crate::util::retry::RetryPolicy;

/// Global default config (lazy-initialized from env).
static DEFAULT_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

const MAX_STEPS_ENV: &str = "TILLER_MAX_STEPS";
const TOKEN_LIMIT_ENV: &str = "TILLER_TOKEN_LIMIT";
const PARALLEL_TOOLS_ENV: &str = "TILLER_PARALLEL_TOOLS";

/// Provider credentials and base URLs, keyed by provider name.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    api_keys: Arc<RwLock<HashMap<String, String>>>,
    base_urls: Arc<RwLock<HashMap<String, String>>>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables (ANTHROPIC_API_KEY, OPENAI_API_KEY, etc.).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let config = Self::new();

        let key_mappings = [
            ("ANTHROPIC_API_KEY", "anthropic"),
            ("OPENAI_API_KEY", "openai"),
            ("MINIMAX_API_KEY", "minimax"),
            ("GLM_API_KEY", "glm"),
            ("DEEPSEEK_API_KEY", "deepseek"),
        ];
        for (env_var, provider) in key_mappings {
            if let Ok(key) = std::env::var(env_var) {
                config.set_api_key(provider, key);
            }
        }

        let url_mappings = [
            ("ANTHROPIC_BASE_URL", "anthropic"),
            ("OPENAI_BASE_URL", "openai"),
            ("MINIMAX_BASE_URL", "minimax"),
            ("GLM_BASE_URL", "glm"),
            ("DEEPSEEK_BASE_URL", "deepseek"),
        ];
        for (env_var, provider) in url_mappings {
            if let Ok(url) = std::env::var(env_var) {
                config.set_base_url(provider, url);
            }
        }

        config
    }

    /// Get (or create) the global default config.
    pub fn global() -> &'static RuntimeConfig {
        DEFAULT_CONFIG.get_or_init(Self::from_env)
    }

    pub fn set_api_key(&self, provider: &str, key: impl Into<String>) {
        if let Ok(mut keys) = self.api_keys.write() {
            keys.insert(provider.to_string(), key.into());
        }
    }

    pub fn get_api_key(&self, provider: &str) -> Option<String> {
        self.api_keys.read().ok()?.get(provider).cloned()
    }

    pub fn set_base_url(&self, provider: &str, url: impl Into<String>) {
        if let Ok(mut urls) = self.base_urls.write() {
            urls.insert(provider.to_string(), url.into());
        }
    }

    pub fn get_base_url(&self, provider: &str) -> Option<String> {
        self.base_urls.read().ok()?.get(provider).cloned()
    }
}

/// Loop behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model calls allowed per task before giving up.
    pub max_steps: usize,
    /// Estimated or reported history size that triggers summarization.
    pub token_limit: usize,
    pub parallel_tools: bool,
    /// Ask the backend for extended thinking.
    pub enable_thinking: bool,
    /// Thinking budget sent when `enable_thinking` is set.
    pub thinking_budget: u32,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Use the streaming entry point and forward deltas as events.
    pub stream: bool,
    #[serde(with = "duration_secs")]
    pub tool_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub provider_timeout: Duration,
    /// How long in-flight tools may keep running after cancellation.
    #[serde(with = "duration_secs")]
    pub cancel_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            token_limit: 100_000,
            parallel_tools: true,
            enable_thinking: true,
            thinking_budget: 4_096,
            max_tokens: None,
            temperature: None,
            stream: true,
            tool_timeout: Duration::from_secs(300),
            provider_timeout: Duration::from_secs(120),
            cancel_grace: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl AgentConfig {
    /// Parse a TOML fragment such as an `[agent]` table handed over by the host.
    pub fn from_toml_str(input: &str) -> Result<Self, TillerError> {
        toml::from_str(input).map_err(|e| TillerError::Configuration(e.to_string()))
    }

    /// Apply `TILLER_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_positive(lookup(MAX_STEPS_ENV)) {
            self.max_steps = v;
        }
        if let Some(v) = parse_positive(lookup(TOKEN_LIMIT_ENV)) {
            self.token_limit = v;
        }
        if let Some(v) = lookup(PARALLEL_TOOLS_ENV).and_then(|v| parse_bool(&v)) {
            self.parallel_tools = v;
        }
        self
    }
}

fn parse_positive(value: Option<String>) -> Option<usize> {
    value?.trim().parse::<usize>().ok().filter(|v| *v > 0)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Serde adapter for durations written as (fractional) seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
