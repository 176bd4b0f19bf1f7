//! Bounded retry with a fixed delay between attempts.
//!
//! Used only at the call sites that must not give up on the first failure:
//! queue cleanup, deployment property writes and credential calls.

use std::time::Duration;

use tracing::{error, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, delay: Duration) -> Self { Self { max_attempts: max_attempts.max(1), delay } }

    /// Queue cleanup: 5 attempts, 1s apart.
    pub fn cleanup() -> Self { Self::new(5, Duration::from_secs(1)) }

    /// Property writes and credential calls: 3 attempts, 1s apart.
    pub fn bounded() -> Self { Self::new(3, Duration::from_secs(1)) }
}

impl Default for RetryConfig {
    fn default() -> Self { Self::bounded() }
}

/// Retry `operation` on every error until `config.max_attempts` is reached.
pub async fn retry_with_delay<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_delay`], but errors for which `should_retry` is false are returned at once.
pub async fn retry_if<F, Fut, T, E, P>(config: &RetryConfig, operation_name: &str, should_retry: P, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(out) => return Ok(out),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(operation = %operation_name, attempt, error = %e, "operation failed after max retries");
                    return Err(e);
                }
                warn!(operation = %operation_name, attempt, error = %e, delay_ms = config.delay.as_millis() as u64, "operation failed, retrying");
                tokio::time::sleep(config.delay).await;
            }
        }
    }
}
