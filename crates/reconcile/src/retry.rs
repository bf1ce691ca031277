//! Exponential backoff with jitter for object-store writes.

use std::future::Future;
use std::time::Duration;

use appset_core::{Error, Result};
use rand::Rng;
use tracing::{debug, error, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one; at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self { max_attempts: attempts, ..Default::default() }
    }

    /// Millisecond delays, for tests and offline runs.
    pub fn fast(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is used up. The last error is returned.
///
/// Conflicts are retried at once: the operation is expected to re-read the
/// live object itself, so waiting gains nothing.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;
    loop {
        attempt += 1;
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                error!(operation = %operation_name, attempt, error = %e, "retry: giving up");
                return Err(e);
            }
            Err(Error::ReconcileConflict(what)) => {
                debug!(operation = %operation_name, attempt, conflict = %what, "retry: conflict, retrying now");
            }
            Err(e) => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(operation = %operation_name, attempt, error = %e, delay_ms = sleep.as_millis() as u64, "retry: attempt failed");
                tokio::time::sleep(sleep).await;
                delay = Duration::from_secs_f64((delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()));
            }
        }
    }
}
