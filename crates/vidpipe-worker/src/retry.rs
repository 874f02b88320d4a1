//! Retry policy for failed jobs and backoff helpers for broker calls.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Exponential backoff between attempts of a failed job.
///
/// The delay before attempt `n + 1` is `base_delay * 2^(n - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        Self {
            base_delay: secs("RETRY_BASE_DELAY_SECS").unwrap_or(defaults.base_delay),
            max_delay: secs("RETRY_MAX_DELAY_SECS").unwrap_or(defaults.max_delay),
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// What to do with a job whose attempt `attempt` just failed.
    pub fn decide(&self, attempt: u32, max_attempts: u32, permanent: bool) -> RetryDecision {
        if permanent || attempt >= max_attempts {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry(self.delay_for_attempt(attempt))
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    DeadLetter,
}

/// Run `operation` up to `attempts` times with a short doubling pause between tries.
///
/// Used for acks and other broker bookkeeping where a transient Redis error should not lose the
/// job outcome.
pub async fn retry_async<F, Fut, T, E>(
    operation_name: &str,
    attempts: u32,
    pause: Duration,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut delay = pause;
    let mut tried = 0u32;

    loop {
        tried += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if tried < attempts => {
                debug!("{} attempt {} failed, retrying in {:?}: {}", operation_name, tried, delay, e);
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Counts consecutive failures of a background loop and mutes its logs after a threshold.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    max_logged_failures: u32,
}

impl FailureTracker {
    pub fn new(max_logged_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_logged_failures,
        }
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > self.max_logged_failures {
            debug!("Recovered after {} consecutive failures", self.consecutive_failures);
        }
        self.consecutive_failures = 0;
    }

    /// Returns `true` when this failure should still be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures == self.max_logged_failures + 1 {
            warn!(
                "Suppressing further failure logs after {} consecutive failures",
                self.max_logged_failures
            );
        }
        self.consecutive_failures <= self.max_logged_failures
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}
