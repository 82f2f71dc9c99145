//! Retry with exponential backoff and bounded polling

use crate::error::{ProviderError, Result};
use crate::provider::{PollConfig, RetryConfig};
use std::future::Future;
use tokio::time::{Instant, sleep};

/// Run `f` until it succeeds, retrying only transient errors
///
/// Only wrap calls that are safe to repeat: describes, listings, and
/// creations that are idempotent by name or identifier.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Transient provider error, retrying: {}",
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Poll `check` until it reports `true` or the deadline passes
///
/// Transient errors during a poll are logged and treated as "not yet".
pub async fn wait_until<F, Fut>(poll: &PollConfig, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + poll.timeout;
    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) if e.is_transient() => {
                tracing::debug!("Transient error while waiting for {}: {}", what, e);
            }
            Err(e) => return Err(e),
        }

        if Instant::now() + poll.interval > deadline {
            return Err(ProviderError::Timeout(what.to_string()));
        }
        sleep(poll.interval).await;
    }
}
