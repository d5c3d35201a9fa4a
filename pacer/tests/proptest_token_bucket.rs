//! Property-based tests for the token bucket.
//!
//! Verifies the admission invariants:
//! - Whole tokens never exceed capacity
//! - Executions over any horizon stay within capacity + rate * horizon
//! - next_token_at is strictly in the future when empty, and honored
//! - Partial accrual carries across calls
//! - A clock that runs backwards credits nothing

use std::time::Duration;

use proptest::prelude::*;

use pacer::scheduler::TokenBucket;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_capacity() -> impl Strategy<Value = u32> {
    1u32..50
}

fn arb_refill_rate() -> impl Strategy<Value = f64> {
    (1u32..50).prop_map(|r| r as f64)
}

/// Rates whose refill period is an even number of milliseconds
fn arb_even_period_rate() -> impl Strategy<Value = f64> {
    prop::sample::select(vec![1.0, 2.0, 4.0, 5.0, 10.0, 20.0, 25.0])
}

/// Increasing time sequence in milliseconds
fn arb_time_sequence(len: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..500, len).prop_map(|deltas| {
        let mut times = Vec::with_capacity(deltas.len());
        let mut t = 0u64;
        for d in deltas {
            t += d;
            times.push(t);
        }
        times
    })
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

// ────────────────────────────────────────────────────────────────────
// Capacity
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// available() never exceeds capacity, whatever happens in between.
    #[test]
    fn prop_tokens_never_exceed_capacity(
        capacity in arb_capacity(),
        rate in arb_refill_rate(),
        times in arb_time_sequence(40),
        consume_mask in prop::collection::vec(any::<bool>(), 40),
    ) {
        let mut b = TokenBucket::new(capacity, rate, Duration::ZERO);
        for (&t, &consume) in times.iter().zip(&consume_mask) {
            if consume {
                b.try_consume(ms(t));
            }
            let avail = b.available(ms(t));
            prop_assert!(avail <= capacity, "available {} > capacity {} at t={}ms", avail, capacity, t);
        }
    }

    /// Greedy consumption over a horizon is bounded by burst plus refill.
    #[test]
    fn prop_consumption_bounded_by_rate(
        capacity in arb_capacity(),
        rate in arb_refill_rate(),
        times in arb_time_sequence(60),
    ) {
        let mut b = TokenBucket::new(capacity, rate, Duration::ZERO);
        let mut consumed = 0u64;
        for &t in &times {
            while b.try_consume(ms(t)) {
                consumed += 1;
            }
            let horizon_secs = t as f64 / 1000.0;
            let bound = capacity as f64 + rate * horizon_secs + 1.0;
            prop_assert!(
                (consumed as f64) <= bound,
                "consumed {} > bound {} by t={}ms (capacity {}, rate {})",
                consumed, bound, t, capacity, rate
            );
        }
        prop_assert_eq!(b.stats().total_consumed, consumed);
    }
}

// ────────────────────────────────────────────────────────────────────
// Next-token deadline
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// An empty bucket promises a future deadline and keeps the promise.
    #[test]
    fn prop_next_token_at_is_future_and_honored(
        capacity in arb_capacity(),
        rate in arb_refill_rate(),
        start_ms in 0u64..10_000,
    ) {
        let start = ms(start_ms);
        let mut b = TokenBucket::new(capacity, rate, start);
        while b.try_consume(start) {}

        let next = b.next_token_at(start);
        prop_assert!(next > start, "next_token_at {:?} not after {:?}", next, start);
        prop_assert!(!b.try_consume(next - Duration::from_nanos(1)), "token arrived before {:?}", next);
        prop_assert!(b.try_consume(next), "no token at promised time {:?}", next);
    }

    /// A bucket holding tokens is ready now.
    #[test]
    fn prop_next_token_at_now_when_available(
        capacity in arb_capacity(),
        rate in arb_refill_rate(),
        now_ms in 0u64..10_000,
    ) {
        let mut b = TokenBucket::new(capacity, rate, Duration::ZERO);
        prop_assert_eq!(b.next_token_at(ms(now_ms)), ms(now_ms));
        prop_assert_eq!(b.wait_time(ms(now_ms)), Duration::ZERO);
    }
}

// ────────────────────────────────────────────────────────────────────
// Accrual
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Half a period left over after one credit is not lost.
    #[test]
    fn prop_partial_accrual_carries_over(
        capacity in 2u32..50,
        rate in arb_even_period_rate(),
    ) {
        let period_ms = (1000.0 / rate) as u64;
        let mut b = TokenBucket::new_empty(capacity, rate, Duration::ZERO);

        prop_assert_eq!(b.available(ms(period_ms / 2)), 0);
        prop_assert_eq!(b.available(ms(period_ms + period_ms / 2)), 1);
        prop_assert_eq!(b.available(ms(2 * period_ms)), 2);
    }

    /// Long idle periods fill the bucket exactly to capacity.
    #[test]
    fn prop_idle_fills_to_capacity(
        capacity in arb_capacity(),
        rate in arb_refill_rate(),
        extra_secs in 0u64..100,
    ) {
        let mut b = TokenBucket::new_empty(capacity, rate, Duration::ZERO);
        let full_after = (capacity as f64 / rate).ceil() as u64 + 1;
        prop_assert_eq!(b.available(Duration::from_secs(full_after + extra_secs)), capacity);
    }

    /// Time running backwards credits nothing and does not disturb later accrual.
    #[test]
    fn prop_backwards_clock_credits_nothing(
        capacity in arb_capacity(),
        rate in arb_refill_rate(),
        forward_ms in 1u64..10_000,
        back_ms in 1u64..10_000,
    ) {
        let forward = ms(forward_ms);
        let mut b = TokenBucket::new(capacity, rate, forward);
        while b.try_consume(forward) {}

        let earlier = forward.saturating_sub(ms(back_ms));
        prop_assert_eq!(b.available(earlier), 0);
        prop_assert!(!b.try_consume(earlier));

        let later = forward + Duration::from_secs((1.0 / rate).ceil() as u64);
        prop_assert!(b.available(later) >= 1);
    }
}
