// Token bucket admission control.
//
// Tokens refill lazily from elapsed time on every call. The lock is a plain
// `parking_lot::Mutex` and is never held across an await, so a caller cancelled while
// waiting can not leave the bucket half-updated.

use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::settings::RateLimitConfig;

const HISTORY_LEN: usize = 1000;
// Upper bound on a single throttling delay.
const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
    history: VecDeque<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    requests_per_second: f64,
    burst_capacity: f64,
    window: Duration,
    bucket: Mutex<Bucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub current_tokens: f64,
    pub max_tokens: f64,
    pub requests_per_second: f64,
    pub recent_requests: usize,
    pub time_window_seconds: u64,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst_capacity: u32) -> Self {
        Self::with_window(requests_per_second, burst_capacity, Duration::from_secs(60))
    }

    pub fn with_window(requests_per_second: f64, burst_capacity: u32, window: Duration) -> Self {
        let burst_capacity = f64::from(burst_capacity.max(1));
        Self {
            requests_per_second: requests_per_second.max(f64::MIN_POSITIVE),
            burst_capacity,
            window,
            bucket: Mutex::new(Bucket {
                tokens: burst_capacity,
                last_update: Instant::now(),
                history: VecDeque::with_capacity(HISTORY_LEN),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::with_window(
            config.requests_per_second,
            config.burst_capacity,
            Duration::from_secs(config.window_seconds),
        )
    }

    /// Debits `tokens` if the bucket holds enough of them.
    pub fn acquire(&self, tokens: u32) -> bool {
        self.acquire_at(tokens, Instant::now())
    }

    fn acquire_at(&self, tokens: u32, now: Instant) -> bool {
        let requested = f64::from(tokens);
        let mut bucket = self.bucket.lock();

        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.requests_per_second).min(self.burst_capacity);
        bucket.last_update = bucket.last_update.max(now);

        if bucket.tokens >= requested {
            bucket.tokens -= requested;
            if bucket.history.len() == HISTORY_LEN {
                bucket.history.pop_front();
            }
            bucket.history.push_back(now);
            true
        } else {
            false
        }
    }

    /// Acquires or, failing that, sleeps for `tokens / rate` (at most a minute) and lets the
    /// caller through.
    ///
    /// There is no second acquire after the sleep: this is a best-effort throttle that
    /// bounds the added latency, not a hard admission cap. Returns the time slept.
    pub async fn wait_if_needed(&self, tokens: u32) -> Duration {
        if self.acquire(tokens) {
            return Duration::ZERO;
        }

        let wait = Duration::try_from_secs_f64(f64::from(tokens) / self.requests_per_second)
            .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT));
        debug!(wait_ms = wait.as_millis() as u64, "rate limited, delaying request");
        tokio::time::sleep(wait).await;
        wait
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let bucket = self.bucket.lock();
        let recent_requests = bucket
            .history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= self.window)
            .count();

        RateLimiterStats {
            current_tokens: bucket.tokens,
            max_tokens: self.burst_capacity,
            requests_per_second: self.requests_per_second,
            recent_requests,
            time_window_seconds: self.window.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_wait() {
        let limiter = RateLimiter::new(2.0, 2);

        let results: Vec<bool> = (0..4).map(|_| limiter.acquire(1)).collect();
        assert_eq!(results, vec![true, true, false, false]);

        let start = Instant::now();
        let waited = limiter.wait_if_needed(1).await;
        assert_eq!(waited, Duration::from_millis(500));
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(510));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_up_to_capacity() {
        let limiter = RateLimiter::new(10.0, 5);
        for _ in 0..5 {
            assert!(limiter.acquire(1));
        }
        assert!(!limiter.acquire(1));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(limiter.acquire(2));
        assert!(!limiter.acquire(1));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.acquire(0));
        assert_eq!(limiter.stats().current_tokens, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_count_recent_requests_in_window() {
        let limiter = RateLimiter::with_window(100.0, 100, Duration::from_secs(10));
        for _ in 0..3 {
            limiter.acquire(1);
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        limiter.acquire(1);

        let stats = limiter.stats();
        assert_eq!(stats.recent_requests, 1);
        assert_eq!(stats.max_tokens, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degenerate_rate_caps_the_wait() {
        let limiter = RateLimiter::new(0.0, 1);
        assert!(limiter.acquire(1));
        assert!(!limiter.acquire(1));

        let waited = limiter.wait_if_needed(1).await;
        assert_eq!(waited, MAX_WAIT);

        let tiny = RateLimiter::new(1e-20, 1);
        tiny.acquire(1);
        assert_eq!(tiny.wait_if_needed(3).await, MAX_WAIT);
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            ops in proptest::collection::vec((0u32..6, 0u64..2_000), 1..200)
        ) {
            let limiter = RateLimiter::new(3.0, 5);
            let mut now = Instant::now();
            for (tokens, step_ms) in ops {
                now += Duration::from_millis(step_ms);
                limiter.acquire_at(tokens, now);
                let current = limiter.bucket.lock().tokens;
                prop_assert!(current >= 0.0);
                prop_assert!(current <= 5.0);
            }
        }
    }
}
