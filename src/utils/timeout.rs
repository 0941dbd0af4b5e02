//! Async timeout wrappers and default durations.
//!
//! All timeouts in the crate are durations relative to issuance on the
//! tokio clock, which keeps them testable with `tokio::time::pause`.

use std::future::Future;
use std::time::Duration;

use crate::error::{CmError, Result};

/// Default timeout for connect and handshake operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval for idle keepalives.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Run a future with a timeout, mapping expiry to the given error.
///
/// # Errors
/// Returns `err` if the duration elapses first, otherwise the future's own
/// result.
pub async fn with_timeout<F, T>(fut: F, duration: Duration, err: CmError) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(err),
    }
}

/// Run a future with a timeout, mapping expiry to `CmError::Timeout`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout(fut, duration, CmError::Timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expiry_maps_to_given_error() {
        let result: Result<()> = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            Duration::from_secs(1),
            CmError::HandshakeTimeout,
        )
        .await;
        assert!(matches!(result, Err(CmError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn completed_future_passes_through() {
        let result = with_timeout_error(async { Ok(42u32) }, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), 42);
    }
}
