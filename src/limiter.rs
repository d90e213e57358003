use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::AdmissionError;

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide token bucket guarding aggregate admission throughput.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate` tokens per second, holding at most `burst`. Starts full.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self::new_at(rate, burst, Instant::now())
    }

    pub fn new_at(rate: f64, burst: f64, now: Instant) -> Self {
        let burst = burst.max(0.0);
        Self {
            rate: rate.max(0.0),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: now,
            }),
        }
    }

    pub fn check(&self) -> Result<(), AdmissionError> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> Result<(), AdmissionError> {
        if self.try_acquire_at(now) {
            Ok(())
        } else {
            Err(AdmissionError::RateLimited)
        }
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available at `now`, after refill.
    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // A clock reading older than the last refill counts as no elapsed time.
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        if now > state.last_refill {
            state.last_refill = now;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_reject() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(1.0, 3.0, start);
        assert!(bucket.try_acquire_at(start));
        assert!(bucket.try_acquire_at(start));
        assert!(bucket.try_acquire_at(start));
        assert_eq!(bucket.check_at(start), Err(AdmissionError::RateLimited));
    }

    #[test]
    fn refill_is_proportional_and_capped() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 5.0, start);
        for _ in 0..5 {
            assert!(bucket.try_acquire_at(start));
        }
        let tokens = bucket.available_at(start + Duration::from_millis(200));
        assert!((tokens - 2.0).abs() < 1e-9);
        assert_eq!(bucket.available_at(start + Duration::from_secs(60)), 5.0);
    }

    #[test]
    fn tokens_stay_within_bounds() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(7.0, 4.0, start);
        let mut now = start;
        for step in 0..500u64 {
            now += Duration::from_millis(step % 13 * 17);
            bucket.try_acquire_at(now);
            let tokens = bucket.available_at(now);
            assert!(tokens >= 0.0);
            assert!(tokens <= 4.0);
        }
    }

    #[test]
    fn sustained_rate_below_limit_is_never_rejected() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 10.0, start);
        // 8 requests per second for 30 seconds.
        for i in 0..240u64 {
            let now = start + Duration::from_millis(i * 125);
            assert!(bucket.try_acquire_at(now), "request {i} rejected");
        }
    }

    #[test]
    fn clock_going_backwards_adds_nothing() {
        let start = Instant::now() + Duration::from_secs(10);
        let bucket = TokenBucket::new_at(100.0, 1.0, start);
        assert!(bucket.try_acquire_at(start));
        assert!(!bucket.try_acquire_at(start - Duration::from_secs(5)));
    }
}
