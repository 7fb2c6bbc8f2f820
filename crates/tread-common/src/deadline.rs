//! Deadline helpers.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run an operation with a timeout.
///
/// Returns [`crate::TreadError::Timeout`] when the deadline passes first.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    match tokio::time::timeout(timeout, operation()).await {
        Ok(value) => Ok(value),
        Err(_) => {
            warn!(?timeout, "Operation exceeded its deadline");
            Err(crate::TreadError::Timeout(timeout))
        }
    }
}
