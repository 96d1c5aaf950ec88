//! Retry and timeout combinators for idempotent database operations.
//!
//! `retry` is meant for probes and connection setup. It never wraps a whole
//! transaction callback: replaying a partially applied scope is not idempotent.

use crate::error::LoaderError;
use std::future::Future;
use std::time::Duration;

/// Default number of attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Delay before the first retry; doubles on each further attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

/// Run `operation` up to `max_attempts` times, backing off exponentially
/// (`base_delay`, `2 * base_delay`, ...) between attempts that fail with a
/// retriable error. Other errors are returned immediately.
pub async fn retry<F, Fut, T>(
    mut operation: F,
    max_attempts: usize,
    base_delay: Duration,
) -> Result<T, LoaderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LoaderError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < max_attempts => {
                let delay = base_delay.saturating_mul(1 << (attempt - 1).min(16));
                log::warn!(
                    "attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    max_attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fail with `Timeout { operation: message }` if `future` does not finish within `limit`.
pub async fn with_timeout<F, T>(future: F, limit: Duration, message: &str) -> Result<T, LoaderError>
where
    F: Future<Output = Result<T, LoaderError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(LoaderError::timeout(message, limit)),
    }
}
