//! Timeout and cancellation utilities.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| crate::ChatKitError::Timeout(timeout))
}

/// Run an operation until it completes or `token` is cancelled, whichever comes first.
///
/// The operation's future is dropped on cancellation.
pub async fn with_cancel<T, Fut>(token: &CancellationToken, operation: Fut) -> crate::Result<T>
where
    Fut: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(crate::ChatKitError::Cancelled),
        value = operation => Ok(value),
    }
}
