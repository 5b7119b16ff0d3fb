//! Deadlock-aware retry with exponential backoff and jitter.
//!
//! Only deadlock-class errors (see [`DeadlockClassify`]) are retried. Any
//! other error is returned on the attempt that produced it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use census_types::DeadlockClassify;

/// Default number of attempts.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default delay before the first retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default upper bound of the random jitter added to each delay.
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(1000);

/// Default cap on the exponential part of the delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// How a unit of work is retried after a deadlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    /// Upper bound of the uniform random jitter added to each delay.
    pub max_jitter: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt count and base delay, default jitter.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Set the jitter bound.
    #[must_use]
    pub const fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Set the cap on the exponential delay.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Attempts actually made: `max_retries`, at least one.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay after failed attempt `attempt` (1-based), without jitter:
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) plus uniform jitter in `0..=max_jitter`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff(attempt).saturating_add(self.jitter())
    }

    fn jitter(&self) -> Duration {
        let bound = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=bound))
    }
}

/// Run `work`, retrying deadlock-class failures under `policy`.
///
/// After the last attempt the last error is returned as-is.
///
/// # Errors
///
/// Returns the first non-deadlock error, or the last deadlock error once
/// every attempt has been used.
pub async fn run_with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut work: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: DeadlockClassify + Display,
{
    let attempts = policy.attempts();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let err = match work().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Succeeded after deadlock retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_deadlock() {
            return Err(err);
        }
        if attempt >= attempts {
            tracing::error!(attempts, error = %err, "Deadlock retries exhausted");
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            attempt,
            max_attempts = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Deadlock detected, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
