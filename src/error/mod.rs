//! Error types for tiller.
//!
//! Provider failures carry a [`ProviderErrorKind`] that the retry controller
//! inspects. Tool and summarization failures never surface here during a run:
//! the loop folds them into the conversation instead.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What went wrong talking to a model backend.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Connection failure, timeout, or a 5xx answer.
    Transport,
    /// The backend throttled the request.
    RateLimited,
    /// The backend answered with something that does not decode into a response.
    Malformed,
    /// Credentials were rejected (401/403).
    Authentication,
    /// The backend refused the request itself (other 4xx).
    InvalidRequest,
}

/// Failure of a single provider call.
#[derive(Error, Debug)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from an HTTP answer.
    pub status: Option<u16>,
    /// Server-provided hint for how long to wait (rate limiting).
    pub retry_after: Option<Duration>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
            source: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transport, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ProviderErrorKind::RateLimited, message)
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Malformed, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Authentication, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_decode() {
            ProviderErrorKind::Malformed
        } else {
            ProviderErrorKind::Transport
        };
        let status = err.status().map(|s| s.as_u16());
        Self {
            status,
            ..Self::new(kind, err.to_string())
        }
        .with_source(err)
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err.to_string()).with_source(err)
    }
}

/// Retries ran out; `cause` is the last failure seen.
#[derive(Error, Debug)]
#[error("provider call failed after {attempts} attempts: {cause}")]
pub struct RetryExhaustedError {
    #[source]
    pub cause: ProviderError,
    pub attempts: u32,
}

/// The summarizing call could not produce a summary.
#[derive(Error, Debug)]
pub enum SummarizationError {
    #[error("summarization call failed: {0}")]
    Call(#[source] Box<TillerError>),

    #[error("summarization returned no text")]
    Empty,

    #[error("summarization cancelled")]
    Cancelled,
}

/// Primary error type for all tiller operations.
#[derive(Error, Debug)]
pub enum TillerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    RetryExhausted(#[from] RetryExhaustedError),

    #[error(transparent)]
    Summarization(#[from] SummarizationError),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TillerError {
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Provider(err) => provider_category(err.kind),
            Self::RetryExhausted(err) => provider_category(err.cause.kind),
            Self::Summarization(_) => ErrorCategory::Summarization,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Io(_) => ErrorCategory::Network,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::InvalidArgument(_) | Self::InvalidState(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// An exhausted retry is never retryable again, whatever its cause.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, Self::RetryExhausted(_)) {
            return false;
        }
        matches!(
            self.category(),
            ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Timeout
        )
    }

    /// Number of provider attempts behind this error, if it came from one.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted(err) => Some(err.attempts),
            Self::Provider(_) => Some(1),
            _ => None,
        }
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Authentication => RecoverySuggestion::CheckCredentials,
            ErrorCategory::RateLimit | ErrorCategory::Network => {
                RecoverySuggestion::RetryWithBackoff
            }
            ErrorCategory::Timeout => RecoverySuggestion::IncreaseTimeout,
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            ErrorCategory::ToolExecution => RecoverySuggestion::CheckToolImplementation,
            ErrorCategory::Summarization => RecoverySuggestion::ReduceInputSize,
            ErrorCategory::Protocol | ErrorCategory::Serialization => RecoverySuggestion::ReportBug,
            ErrorCategory::Api => RecoverySuggestion::CheckConfiguration,
            ErrorCategory::Cancelled | ErrorCategory::Unknown => RecoverySuggestion::None,
        }
    }
}

fn provider_category(kind: ProviderErrorKind) -> ErrorCategory {
    match kind {
        ProviderErrorKind::Transport => ErrorCategory::Network,
        ProviderErrorKind::RateLimited => ErrorCategory::RateLimit,
        ProviderErrorKind::Malformed => ErrorCategory::Protocol,
        ProviderErrorKind::Authentication => ErrorCategory::Authentication,
        ProviderErrorKind::InvalidRequest => ErrorCategory::Api,
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TillerError>;
