//! Bounded exponential backoff for retryable remote operations.
//!
//! A [`RetryPolicy`] describes the schedule; a [`Backoff`] is the per-call
//! attempt counter that the caller owns and drops (or resets) when done.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Policy with the default multiplier and cap.
    pub fn new(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_attempts,
            ..Self::default()
        }
    }

    /// Calculate the delay after a given failed attempt (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Start a fresh attempt counter for one logical operation.
    pub const fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            attempt: 0,
        }
    }
}

/// Attempt counter for one logical operation.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
}

impl Backoff<'_> {
    /// Number of failures recorded so far.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failure and return how long to wait before the next attempt,
    /// or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let failed = self.attempt;
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        Some(self.policy.delay_for_attempt(failed))
    }

    /// Forget previous failures.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Returned when every attempt allowed by the policy failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy's attempt budget is spent,
/// sleeping between attempts.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut backoff = policy.backoff();
    loop {
        match op().await {
            Ok(value) => {
                if backoff.attempt() > 0 {
                    debug!(operation, attempts = backoff.attempt() + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        operation,
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis(),
                        "Operation failed, retrying"
                    );
                    sleep(delay).await;
                }
                None => {
                    warn!(
                        operation,
                        error = %e,
                        attempts = backoff.attempt(),
                        "Retry budget exhausted"
                    );
                    return Err(Exhausted {
                        attempts: backoff.attempt(),
                        last_error: e,
                    });
                }
            },
        }
    }
}
