//! Retry with exponential backoff and jitter for provider calls.
//!
//! Only transient [`ProviderError`]s are retried. A rate-limit response
//! stretches the wait to at least the delay the provider asked for.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::config::ExecutorConfig;
use crate::error::ProviderError;

/// Backoff settings for transient provider failures.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts including the first one; at least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Multiplier applied after each retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Builds the retry policy from executor settings.
    #[must_use]
    pub fn from_executor(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            ..Self::default()
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or runs out of
/// attempts. Returns the final result with the number of attempts made.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> (Result<T, ProviderError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return (Ok(result), attempt),
            Err(e) if !e.is_transient() => return (Err(e), attempt),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return (Err(e), attempt);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let mut wait = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                if let Some(secs) = e.retry_after_secs() {
                    wait = wait.max(Duration::from_secs(secs));
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(wait).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
