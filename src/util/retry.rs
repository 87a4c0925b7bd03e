//! Retry with bounded exponential backoff.
//!
//! The delay before retry `n` (counting from 0) is
//! `min(initial_delay * exponential_base^n, max_delay)`. There is no jitter,
//! so schedules are reproducible.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_secs;
use crate::error::{ProviderError, ProviderErrorKind, RetryExhaustedError, TillerError};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// When false, a retryable failure is reported as exhausted after one attempt.
    pub enabled: bool,
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Error kinds worth another attempt. `Malformed` is ignored here.
    pub retryable: Vec<ProviderErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            retryable: vec![ProviderErrorKind::Transport, ProviderErrorKind::RateLimited],
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the retry following failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs < 0.0 || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn is_retryable(&self, err: &ProviderError) -> bool {
        err.kind != ProviderErrorKind::Malformed && self.retryable.contains(&err.kind)
    }

    /// Execute an async provider call with retry.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, TillerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.execute_observed(operation, |_, _, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry(error, attempt, delay)`
    /// before each backoff sleep.
    ///
    /// A non-retryable failure is returned as [`TillerError::Provider`] right
    /// away; running out of retries yields [`TillerError::RetryExhausted`]
    /// wrapping the last failure.
    pub async fn execute_observed<F, Fut, T, O>(
        &self,
        mut operation: F,
        mut on_retry: O,
    ) -> Result<T, TillerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        O: FnMut(&ProviderError, u32, Duration),
    {
        let max_retries = if self.enabled { self.max_retries } else { 0 };
        let mut attempt = 0u32;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.is_retryable(&err) {
                return Err(TillerError::Provider(err));
            }
            if attempt >= max_retries {
                return Err(RetryExhaustedError {
                    cause: err,
                    attempts: attempt + 1,
                }
                .into());
            }

            let mut delay = self.delay_for(attempt);
            if let Some(hint) = err.retry_after {
                delay = delay.max(hint.min(self.max_delay));
            }

            tracing::warn!(
                attempt = attempt + 1,
                max_retries,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "retrying provider call"
            );
            on_retry(&err, attempt, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
