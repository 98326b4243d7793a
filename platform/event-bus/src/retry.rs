//! Bounded retry with fixed or exponential backoff
//!
//! Used when dialing the broker: transient unavailability is absorbed here so
//! callers only ever see the terminal failure.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How the delay between attempts evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// Delay doubles per retry up to `max_backoff`, with jitter in `[d/2, d]`
    Exponential,
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for exponential growth
    pub max_backoff: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    /// 30 attempts, 5 seconds apart
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl RetryConfig {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: delay,
            max_backoff: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: initial,
            max_backoff: max,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Upper bound of the delay after the given failed attempt (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.initial_backoff,
            BackoffStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(16);
                let grown = self.initial_backoff.saturating_mul(1u32 << shift);
                std::cmp::min(grown, self.max_backoff)
            }
        }
    }

    /// Delay to sleep after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let half = base / 2;
                let spread = (base - half).as_millis() as u64;
                if spread == 0 {
                    return base;
                }
                half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
            }
        }
    }
}

/// Retry a fallible async operation until it succeeds or attempts run out
///
/// # Arguments
/// * `operation` - The async operation to retry
/// * `config` - Retry configuration
/// * `context` - Context string for logging (e.g., "amqp_connect")
///
/// # Returns
/// * `Ok(T)` if operation succeeds within max_attempts
/// * `Err((attempts, E))` with the last error once all attempts are exhausted
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, (u32, E)>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err((attempt, e));
                }

                let backoff = config.delay_for(attempt);
                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying after backoff"
                );

                sleep(backoff).await;
            }
        }
    }
}
