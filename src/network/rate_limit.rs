//! Token Bucket Rate Limiting
//!
//! Process-wide admission control. One bucket gates new connections, another
//! gates decoded packets across every connection. Refill is computed lazily
//! from elapsed time on each check, so an idle bucket costs nothing.
//!
//! Time comes from [`tokio::time::Instant`] so tests can pause the clock.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Smallest wait handed back to callers, so retry loops never spin.
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket shared by every caller of one admission policy.
///
/// The bucket starts full. Each admission consumes one token and tokens
/// flow back at `rate` per second, never above `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket admitting `rate_per_sec` operations per second with
    /// bursts of up to `burst`. Zero values are clamped to 1.
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_rate: f64::from(rate_per_sec.max(1)),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Maximum burst size.
    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> u32 {
        self.refill_rate as u32
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.poll_at(Instant::now()).is_ok()
    }

    /// How long until a token will be available. Zero if one is ready.
    pub fn time_until_available(&self) -> Duration {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        self.wait_for(state.tokens)
    }

    /// Wait until a token is available and take it.
    ///
    /// Deferral only: the caller is never rejected, just delayed.
    pub async fn acquire(&self) {
        loop {
            match self.poll_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Take a token as of `now`, or report how long to wait for one.
    pub(crate) fn poll_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.wait_for(state.tokens))
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // Callers may race with a slightly older `now`; never run time backwards.
        if now <= state.last_refill {
            return;
        }
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    fn wait_for(&self, tokens: f64) -> Duration {
        if tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - tokens) / self.refill_rate).max(MIN_WAIT)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        // The state is two plain numbers, always consistent between statements.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_starts_full_and_drains() {
        let bucket = TokenBucket::new(5, 5);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_zero_limits_clamped() {
        let bucket = TokenBucket::new(0, 0);
        assert_eq!(bucket.capacity(), 1);
        assert_eq!(bucket.rate(), 1);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_refill_is_proportional_to_elapsed_time() {
        let bucket = TokenBucket::new(5, 5);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(bucket.poll_at(start).is_ok());
        }
        assert!(bucket.poll_at(start).is_err());

        // One token every 200ms at 5/s
        let later = start + Duration::from_millis(210);
        assert!(bucket.poll_at(later).is_ok());
        assert!(bucket.poll_at(later).is_err());
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let bucket = TokenBucket::new(5, 5);
        let later = Instant::now() + Duration::from_secs(60);
        let admitted = (0..20).filter(|_| bucket.poll_at(later).is_ok()).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_wait_hint_when_empty() {
        let bucket = TokenBucket::new(20, 1);
        let now = Instant::now();
        assert!(bucket.poll_at(now).is_ok());

        let wait = bucket.poll_at(now).unwrap_err();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_defers_until_refill() {
        let bucket = TokenBucket::new(5, 5);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }

        let start = Instant::now();
        bucket.acquire().await;
        let waited = start.elapsed();

        assert!(waited >= Duration::from_millis(190), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(250), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_attempts_in_one_second_window() {
        let bucket = TokenBucket::new(5, 5);

        let immediate = (0..10).filter(|_| bucket.try_acquire()).count();
        assert_eq!(immediate, 5);

        tokio::time::advance(Duration::from_secs(1)).await;
        let after_refill = (0..10).filter(|_| bucket.try_acquire()).count();
        assert_eq!(after_refill, 5);
    }

    #[tokio::test]
    async fn test_shared_across_tasks() {
        let bucket = Arc::new(TokenBucket::new(1, 10));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move { bucket.try_acquire() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        // A sliver of refill may land while the tasks run.
        assert!((10..=11).contains(&admitted), "admitted {}", admitted);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_burst_plus_refill(
            rate in 1u32..50,
            burst in 1u32..50,
            steps in proptest::collection::vec((0u64..400, 1usize..8), 1..40),
        ) {
            let bucket = TokenBucket::new(rate, burst);
            let start = Instant::now();
            let mut now = start;
            let mut admitted = 0u64;

            for (advance_ms, attempts) in steps {
                now += Duration::from_millis(advance_ms);
                for _ in 0..attempts {
                    if bucket.poll_at(now).is_ok() {
                        admitted += 1;
                    }
                }
            }

            let elapsed = now.duration_since(start).as_secs_f64();
            let ceiling = f64::from(burst) + f64::from(rate) * elapsed;
            prop_assert!(admitted as f64 <= ceiling + 1e-6);
        }
    }
}
