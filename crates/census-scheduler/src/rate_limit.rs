//! Sliding-window start-rate limiter.
//!
//! Allows at most `limit` task starts in any `window`. A caller over the
//! limit sleeps until the oldest start in the window ages out.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Sliding-window limiter over task start times.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Allow `limit` starts per `window`. A zero limit or window disables
    /// limiting.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            starts: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    fn starts(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.starts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    const fn is_disabled(&self) -> bool {
        self.limit == 0 || self.window.is_zero()
    }

    /// Record a start now, or report how long until one is allowed.
    fn try_record(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut starts = self.starts();

        // Prune entries outside the window.
        while starts
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            starts.pop_front();
        }

        if starts.len() < self.limit {
            starts.push_back(now);
            return None;
        }
        let oldest = starts.front().copied().unwrap_or(now);
        Some(
            self.window
                .saturating_sub(now.saturating_duration_since(oldest))
                .max(Duration::from_millis(1)),
        )
    }

    /// Wait until a start is allowed, then record it.
    pub async fn acquire(&self) {
        if self.is_disabled() {
            return;
        }
        while let Some(retry_after) = self.try_record() {
            tracing::debug!(retry_after_ms = retry_after.as_millis(), "Start rate limited");
            tokio::time::sleep(retry_after).await;
        }
    }

    /// Starts recorded in the current window.
    pub fn recent(&self) -> usize {
        let now = Instant::now();
        self.starts()
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.window)
            .count()
    }

    /// Configured starts per window.
    pub const fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_wait_for_window() {
        let limiter = RateLimiter::new(4, Duration::from_secs(1));
        let started = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(limiter.recent(), 4);

        limiter.acquire().await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_millis(1010));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(600)).await;
        limiter.acquire().await;

        let started = Instant::now();
        limiter.acquire().await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(400));
        assert!(waited < Duration::from_millis(410));
    }

    #[tokio::test]
    async fn zero_limit_disables() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.recent(), 0);
    }
}
