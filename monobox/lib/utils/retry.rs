//! Bounded retry with exponential backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::MonoboxError;
use crate::MonoboxResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `operation`, retrying transient store failures with doubling delays.
///
/// Only [`MonoboxError::Store`] is retried. Every other error carries
/// meaning the caller must handle, so it is returned on the first attempt.
pub async fn with_backoff<T, F, Fut>(
    what: &str,
    attempts: u32,
    base_delay: Duration,
    mut operation: F,
) -> MonoboxResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MonoboxResult<T>>,
{
    let mut delay = base_delay;
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Err(MonoboxError::Store(message)) if attempt < attempts => {
                warn!(what, attempt, error = %message, "transient store failure, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
