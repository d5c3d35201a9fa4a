//! Token bucket admission control
//!
//! The bucket holds up to `max_tokens` whole permits and accrues new ones at
//! `refill_rate` per second from elapsed clock time. Refill is lazy: nothing
//! runs in the background, every query first credits the time that passed.
//!
//! Only whole tokens are credited. `last_refill` advances by exactly the time
//! those tokens cost, so a partially accrued token survives to the next call
//! instead of being thrown away. Once the bucket is full the remainder is
//! dropped and accrual restarts from `now`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::clock::Clock;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Snapshot of bucket counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub max_tokens: u32,
    pub refill_rate: f64,
    pub tokens: u32,
    pub total_consumed: u64,
    pub total_denied: u64,
}

/// Single-threaded token bucket; callers pass the current clock time
#[derive(Debug, Clone)]
pub struct TokenBucket {
    max_tokens: u32,
    refill_rate: f64,
    /// Nanoseconds needed to accrue one token
    period_nanos: f64,
    tokens: u32,
    last_refill: Duration,
    total_consumed: u64,
    total_denied: u64,
}

impl TokenBucket {
    /// Create a full bucket
    ///
    /// # Panics
    ///
    /// Panics if `max_tokens` is zero or `refill_rate` is not a positive finite number.
    pub fn new(max_tokens: u32, refill_rate: f64, now: Duration) -> Self {
        assert!(max_tokens > 0, "max_tokens must be positive");
        assert!(
            refill_rate.is_finite() && refill_rate > 0.0,
            "refill_rate must be positive and finite"
        );
        Self {
            max_tokens,
            refill_rate,
            period_nanos: NANOS_PER_SEC / refill_rate,
            tokens: max_tokens,
            last_refill: now,
            total_consumed: 0,
            total_denied: 0,
        }
    }

    /// Create a bucket starting with no tokens
    pub fn new_empty(max_tokens: u32, refill_rate: f64, now: Duration) -> Self {
        let mut bucket = Self::new(max_tokens, refill_rate, now);
        bucket.tokens = 0;
        bucket
    }

    fn refill(&mut self, now: Duration) {
        if now < self.last_refill {
            warn!(?now, last_refill = ?self.last_refill, "TokenBucket::refill: clock went backwards, crediting nothing");
            return;
        }
        if self.tokens >= self.max_tokens {
            self.last_refill = now;
            return;
        }

        let elapsed_nanos = (now - self.last_refill).as_nanos();
        let whole = (elapsed_nanos as f64 / self.period_nanos).floor();
        if whole < 1.0 {
            return;
        }

        let room = self.max_tokens - self.tokens;
        if whole >= room as f64 {
            self.tokens = self.max_tokens;
            self.last_refill = now;
        } else {
            self.tokens += whole as u32;
            // Advance only by what the credited tokens cost; the rest carries over
            let spent = ((whole * self.period_nanos).floor() as u128).min(elapsed_nanos);
            let spent = Duration::new((spent / 1_000_000_000) as u64, (spent % 1_000_000_000) as u32);
            self.last_refill = self.last_refill.saturating_add(spent);
        }
    }

    /// Refill, then take one token if available
    pub fn try_consume(&mut self, now: Duration) -> bool {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            self.total_consumed += 1;
            true
        } else {
            self.total_denied += 1;
            false
        }
    }

    /// Earliest clock time at which `try_consume` can succeed
    ///
    /// Returns `now` when a token is already available, otherwise a time
    /// strictly after `now`.
    pub fn next_token_at(&mut self, now: Duration) -> Duration {
        self.refill(now);
        if self.tokens > 0 {
            return now;
        }
        let next = self
            .last_refill
            .saturating_add(Duration::from_nanos(self.period_nanos.ceil() as u64));
        next.max(now.saturating_add(Duration::from_nanos(1)))
    }

    /// How long until the next token is available
    pub fn wait_time(&mut self, now: Duration) -> Duration {
        self.next_token_at(now).saturating_sub(now)
    }

    /// Whole tokens available right now
    pub fn available(&mut self, now: Duration) -> u32 {
        self.refill(now);
        self.tokens
    }

    /// Progress toward the next token, in `[0, 1)`
    pub fn fractional(&mut self, now: Duration) -> f64 {
        self.refill(now);
        if self.tokens >= self.max_tokens || now < self.last_refill {
            return 0.0;
        }
        let elapsed_nanos = (now - self.last_refill).as_nanos() as f64;
        (elapsed_nanos / self.period_nanos).min(1.0 - f64::EPSILON)
    }

    /// Refill to capacity and restart accrual at `now`
    pub fn reset(&mut self, now: Duration) {
        self.tokens = self.max_tokens;
        self.last_refill = now;
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn stats(&self) -> BucketStats {
        BucketStats {
            max_tokens: self.max_tokens,
            refill_rate: self.refill_rate,
            tokens: self.tokens,
            total_consumed: self.total_consumed,
            total_denied: self.total_denied,
        }
    }
}

/// Thread-safe token bucket bound to a clock
///
/// Refill and decrement happen under one lock, so concurrent callers never
/// double-credit or lose a consumption.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    clock: Arc<dyn Clock>,
    notify: Notify,
}

impl RateLimiter {
    pub fn new(bucket: TokenBucket, clock: Arc<dyn Clock>) -> Self {
        debug!(?bucket, "RateLimiter::new: called");
        Self {
            bucket: Mutex::new(bucket),
            clock,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one token if available, without waiting
    pub fn try_consume(&self) -> bool {
        let now = self.clock.now();
        self.lock().try_consume(now)
    }

    /// Take one token, or report when to try again
    ///
    /// Refill, consume and deadline computation share one critical section.
    pub fn admit(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut bucket = self.lock();
        if bucket.try_consume(now) {
            Ok(())
        } else {
            Err(bucket.next_token_at(now))
        }
    }

    /// Take one token, suspending until one accrues
    ///
    /// Each retry sleeps until the bucket's computed next-token time, or
    /// until [`reset`](Self::reset) refills the bucket early.
    pub async fn acquire(&self) {
        let mut attempts: u32 = 0;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let retry_at = {
                let mut bucket = self.lock();
                let now = self.clock.now();
                if bucket.try_consume(now) {
                    debug!(attempts, "RateLimiter::acquire: token taken");
                    return;
                }
                bucket.next_token_at(now)
            };

            attempts += 1;
            debug!(attempts, ?retry_at, "RateLimiter::acquire: no token, waiting");
            tokio::select! {
                _ = self.clock.sleep_until(retry_at) => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Clock time at which the next token becomes available
    pub fn next_token_at(&self) -> Duration {
        let now = self.clock.now();
        self.lock().next_token_at(now)
    }

    pub fn available(&self) -> u32 {
        let now = self.clock.now();
        self.lock().available(now)
    }

    /// Refill to capacity and wake every `acquire` waiter
    pub fn reset(&self) {
        debug!("RateLimiter::reset: called");
        let now = self.clock.now();
        self.lock().reset(now);
        self.notify.notify_waiters();
    }

    pub fn stats(&self) -> BucketStats {
        self.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::clock::ManualClock;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_starts_full_and_drains() {
        let mut bucket = TokenBucket::new(3, 2.0, Duration::ZERO);
        assert!(bucket.try_consume(Duration::ZERO));
        assert!(bucket.try_consume(Duration::ZERO));
        assert!(bucket.try_consume(Duration::ZERO));
        assert!(!bucket.try_consume(Duration::ZERO));

        let stats = bucket.stats();
        assert_eq!(stats.total_consumed, 3);
        assert_eq!(stats.total_denied, 1);
    }

    #[test]
    fn test_new_empty() {
        let mut bucket = TokenBucket::new_empty(5, 1.0, Duration::ZERO);
        assert_eq!(bucket.available(Duration::ZERO), 0);
        assert_eq!(bucket.available(ms(1000)), 1);
    }

    #[test]
    fn test_half_second_yields_one_token_at_two_per_sec() {
        let mut bucket = TokenBucket::new(3, 2.0, Duration::ZERO);
        for _ in 0..3 {
            assert!(bucket.try_consume(Duration::ZERO));
        }

        assert_eq!(bucket.available(ms(500)), 1);
        assert_eq!(bucket.available(ms(1000)), 2);
    }

    #[test]
    fn test_fractional_remainder_carries_over() {
        let mut bucket = TokenBucket::new_empty(10, 2.0, Duration::ZERO);

        // 1.5 tokens accrued: one credited, half carried
        assert_eq!(bucket.available(ms(750)), 1);
        assert!(bucket.fractional(ms(750)) > 0.49);

        // Another 0.25s completes the carried half
        assert_eq!(bucket.available(ms(1000)), 2);
    }

    #[test]
    fn test_partial_checks_do_not_reset_accrual() {
        let mut bucket = TokenBucket::new_empty(10, 1.0, Duration::ZERO);
        for t in [100, 300, 500, 700, 900] {
            assert_eq!(bucket.available(ms(t)), 0);
        }
        assert_eq!(bucket.available(ms(1000)), 1);
    }

    #[test]
    fn test_capacity_clamp_after_idle() {
        let mut bucket = TokenBucket::new(3, 5.0, Duration::ZERO);
        bucket.try_consume(Duration::ZERO);
        assert_eq!(bucket.available(Duration::from_secs(3600)), 3);

        // Idle time while full is not banked
        for _ in 0..3 {
            assert!(bucket.try_consume(Duration::from_secs(3600)));
        }
        assert!(!bucket.try_consume(Duration::from_secs(3600)));
    }

    #[test]
    fn test_clock_skew_credits_nothing() {
        let mut bucket = TokenBucket::new_empty(3, 1.0, Duration::from_secs(10));
        assert_eq!(bucket.available(Duration::from_secs(5)), 0);
        assert_eq!(bucket.fractional(Duration::from_secs(5)), 0.0);
        assert_eq!(bucket.available(Duration::from_secs(11)), 1);
    }

    #[test]
    fn test_next_token_at() {
        let mut bucket = TokenBucket::new(1, 4.0, Duration::ZERO);
        assert_eq!(bucket.next_token_at(ms(10)), ms(10));

        assert!(bucket.try_consume(ms(10)));
        // Full bucket restarted accrual at 10ms; one token every 250ms
        assert_eq!(bucket.next_token_at(ms(10)), ms(260));
        assert_eq!(bucket.wait_time(ms(100)), ms(160));
        assert!(!bucket.try_consume(ms(259)));
        assert!(bucket.try_consume(ms(260)));
    }

    #[test]
    fn test_next_token_at_fractional_rate_is_reachable() {
        let mut bucket = TokenBucket::new_empty(1, 3.0, Duration::ZERO);
        let at = bucket.next_token_at(Duration::ZERO);
        assert!(at > Duration::ZERO);
        assert!(bucket.try_consume(at));
    }

    #[test]
    #[should_panic(expected = "refill_rate must be positive")]
    fn test_zero_rate_panics() {
        let _ = TokenBucket::new(1, 0.0, Duration::ZERO);
    }

    #[test]
    fn test_rate_limiter_try_consume_uses_clock() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(TokenBucket::new(2, 2.0, Duration::ZERO), clock.clone());

        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
        assert_eq!(limiter.next_token_at(), ms(500));

        clock.advance(ms(500));
        assert!(limiter.try_consume());
    }

    #[test]
    fn test_rate_limiter_admit_reports_retry_time() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(TokenBucket::new(1, 4.0, Duration::ZERO), clock.clone());

        assert_eq!(limiter.admit(), Ok(()));
        assert_eq!(limiter.admit(), Err(ms(250)));

        clock.advance(ms(100));
        assert_eq!(limiter.admit(), Err(ms(250)));

        clock.advance(ms(150));
        assert_eq!(limiter.admit(), Ok(()));
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_waits_for_refill() {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::new(TokenBucket::new_empty(1, 10.0, Duration::ZERO), clock.clone()));

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        clock.advance(ms(100));
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("acquire should complete")
            .expect("acquire task should not panic");
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_wakes_on_reset() {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::new(TokenBucket::new_empty(2, 0.001, Duration::ZERO), clock));

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };

        tokio::task::yield_now().await;
        limiter.reset();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("acquire should complete after reset")
            .expect("acquire task should not panic");
        assert_eq!(limiter.available(), 1);
    }
}
