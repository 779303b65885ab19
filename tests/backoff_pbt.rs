//! Property-based checks for backoff arithmetic.

use std::time::Duration;

use proptest::prelude::*;

use steadfast::ExponentialBackoff;

proptest! {
    // The deterministic part of the delay strictly increases with the
    // attempt count while uncapped.
    #[test]
    fn backoff_is_strictly_monotonic(
        base_ms in 1u64..=1000,
        attempts in 2usize..=10,
    ) {
        let policy = ExponentialBackoff::new(attempts, Duration::from_millis(base_ms));
        for attempt in 1..attempts {
            prop_assert!(
                policy.delay_for_attempt(attempt) > policy.delay_for_attempt(attempt - 1),
                "delay must grow between attempt {} and {}",
                attempt - 1,
                attempt
            );
        }
    }

    // A cap flattens the tail but never reorders it.
    #[test]
    fn capped_backoff_is_non_decreasing(
        base_ms in 1u64..=500,
        cap_ms in 1u64..=5000,
    ) {
        let policy = ExponentialBackoff::new(10, Duration::from_millis(base_ms))
            .with_max_delay(Duration::from_millis(cap_ms));
        for attempt in 1..10 {
            prop_assert!(
                policy.delay_for_attempt(attempt) >= policy.delay_for_attempt(attempt - 1)
            );
            prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(cap_ms.max(base_ms)));
        }
    }
}
