//! Property tests for attempt escalation.

use proptest::prelude::*;
use relay_delivery::{Escalation, RetryLadder};

proptest! {
    /// Following the ladder from any starting attempt never skips an attempt,
    /// never exceeds the maximum before dead-lettering, and always terminates.
    #[test]
    fn ladder_is_monotonic_and_bounded(max_attempts in 1u32..20, start in 1u32..40) {
        let ladder = RetryLadder::new(max_attempts);
        let mut attempt = start;
        let mut steps = 0u32;

        loop {
            match ladder.decide(attempt) {
                Escalation::Retry { next_attempt } => {
                    prop_assert_eq!(next_attempt, attempt + 1);
                    prop_assert!(next_attempt <= max_attempts);
                    attempt = next_attempt;
                    steps += 1;
                    prop_assert!(steps < max_attempts);
                },
                Escalation::DeadLetter { attempt: parked } => {
                    prop_assert_eq!(parked, attempt);
                    prop_assert!(parked >= max_attempts);
                    break;
                },
            }
        }
    }

    /// Exactly `max_attempts` deliveries happen for a message that always fails.
    #[test]
    fn always_failing_message_is_tried_max_times(max_attempts in 1u32..20) {
        let ladder = RetryLadder::new(max_attempts);
        let mut attempt = 1;
        let mut deliveries = 1;

        while let Escalation::Retry { next_attempt } = ladder.decide(attempt) {
            attempt = next_attempt;
            deliveries += 1;
        }

        prop_assert_eq!(deliveries, max_attempts);
    }
}
