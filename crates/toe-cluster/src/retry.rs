//! Bounded retry with backoff and jitter.
//!
//! Used for cluster writes that can fail with optimistic-concurrency
//! conflicts, and by the agent for credential rotation. Only errors accepted by the caller's predicate are retried;
//! anything else is returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Backoff policy for retried operations.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
    /// Fraction of the delay added as random jitter (0.1 = up to +10%).
    pub jitter: f64,
}

impl RetryConfig {
    /// The conflict retry policy: five quick attempts, 10ms apart.
    #[must_use]
    pub fn conflict_default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: 0.1,
        }
    }

    /// Create a policy with the given number of attempts and no delay.
    ///
    /// Useful in tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::conflict_default()
    }
}

/// Run `operation` until it succeeds, fails with a non-retriable error, or
/// the attempt budget is exhausted.
///
/// # Errors
///
/// Returns the first non-retriable error, or the last error once
/// `max_attempts` is reached.
pub async fn retry_when<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) || attempt >= config.max_attempts.max(1) => return Err(e),
            Err(e) => {
                let wait = config.jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = wait.as_millis(),
                    "Retrying after failure"
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
