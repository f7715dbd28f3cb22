//! Per-connector rate limiting
//!
//! A token bucket the engine can both draw from and inspect. A platform 429
//! empties the bucket for the advertised retry window.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// Set when the platform told us to back off
    frozen_until: Option<Instant>,
}

/// Token bucket with background-free lazy refill
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
                frozen_until: None,
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Take one token, suspending until the budget allows it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if let Some(until) = state.frozen_until {
                    if now < until {
                        until - now
                    } else {
                        state.frozen_until = None;
                        continue;
                    }
                } else {
                    self.refill(&mut state, now);
                    if state.tokens >= 1.0 {
                        state.tokens -= 1.0;
                        return;
                    }
                    Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Remaining budget, for scheduling decisions
    pub async fn remaining(&self) -> f64 {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.frozen_until.is_some_and(|until| now < until) {
            return 0.0;
        }
        self.refill(&mut state, now);
        state.tokens
    }

    /// Freeze the bucket after an upstream 429
    pub async fn throttle(&self, retry_after: Duration) {
        let mut state = self.state.lock().await;
        state.tokens = 0.0;
        state.frozen_until = Some(Instant::now() + retry_after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_drains_then_waits_for_refill() {
        let limiter = RateLimiter::new(2, 1.0);
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(limiter.remaining().await < 1.0);

        let start = Instant::now();
        limiter.acquire().await;
        // Refill rate of 1/s means roughly one second of suspension
        assert!(Instant::now().duration_since(start) >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_freezes_budget_for_retry_window() {
        let limiter = RateLimiter::new(10, 10.0);
        limiter.throttle(Duration::from_secs(5)).await;
        assert_eq!(limiter.remaining().await, 0.0);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(5));
    }
}
