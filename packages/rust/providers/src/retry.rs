//! Exponential backoff with jitter for provider calls.
//!
//! Rate limits and transient failures are retried up to the policy's
//! budget; everything else fails on the first attempt.

use std::future::Future;
use std::time::Duration;

use tokio_retry2::strategy::{ExponentialBackoff, jitter};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

use showrunner_shared::{ProviderError, RetryPolicy};

/// Run `operation` under `policy`, retrying retryable [`ProviderError`]s.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    // Base 2 scaled by half the initial delay: initial, 2x, 4x, ... capped.
    let strategy = ExponentialBackoff::from_millis(2)
        .factor((policy.initial_backoff_ms / 2).max(1))
        .max_delay(Duration::from_secs(policy.max_delay_secs))
        .map(jitter)
        .take(policy.max_retries);

    let mut attempt = 0u32;
    Retry::spawn(strategy, || {
        attempt += 1;
        let current = attempt;
        let call = operation();
        async move {
            match call.await {
                Ok(value) => {
                    if current > 1 {
                        debug!(label, attempt = current, "provider call succeeded after retry");
                    }
                    Ok(value)
                }
                Err(e) if e.is_retryable() => {
                    warn!(label, attempt = current, error = %e, "transient provider error, will retry");
                    Err(RetryError::Transient {
                        err: e,
                        retry_after: None,
                    })
                }
                Err(e) => {
                    warn!(label, attempt = current, error = %e, "permanent provider error");
                    Err(RetryError::Permanent(e))
                }
            }
        }
    })
    .await
}
