//! Timeout helper.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProviderError, TillerError};

/// A deadline passed before the wrapped future finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed(pub Duration);

impl From<Elapsed> for TillerError {
    fn from(elapsed: Elapsed) -> Self {
        TillerError::Timeout(elapsed.0.as_millis() as u64)
    }
}

/// Provider timeouts are transport failures, so the retry policy sees them.
impl From<Elapsed> for ProviderError {
    fn from(elapsed: Elapsed) -> Self {
        ProviderError::transport(format!(
            "request timed out after {}ms",
            elapsed.0.as_millis()
        ))
    }
}

/// Wrap a future with a timeout.
pub async fn with_timeout<T, E>(
    duration: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, E>
where
    E: From<Elapsed>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Elapsed(duration).into()),
    }
}
