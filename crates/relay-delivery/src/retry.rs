//! Attempt-count escalation for failed deliveries.
//!
//! There is no computed backoff: the retry queue's TTL provides a fixed
//! delay, so the only decision is whether a failed message gets another
//! attempt or is parked in the failed queue.

/// Where a failed message goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Republish to the retry queue with the given attempt number.
    Retry {
        /// Attempt number written to the republished message
        next_attempt: u32,
    },
    /// Republish to the failed queue with the attempt number unchanged.
    DeadLetter {
        /// Attempt number that exhausted the ladder
        attempt: u32,
    },
}

/// Maximum-attempt policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLadder {
    max_attempts: u32,
}

impl RetryLadder {
    /// Creates a ladder allowing `max_attempts` deliveries in total.
    /// Values below one are raised to one.
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts: max_attempts.max(1) }
    }

    /// Total deliveries allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides the fate of a message whose attempt `attempt` just failed.
    pub fn decide(&self, attempt: u32) -> Escalation {
        if attempt < self.max_attempts {
            Escalation::Retry { next_attempt: attempt + 1 }
        } else {
            Escalation::DeadLetter { attempt }
        }
    }
}

impl Default for RetryLadder {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_the_last_attempt() {
        let ladder = RetryLadder::new(3);
        assert_eq!(ladder.decide(1), Escalation::Retry { next_attempt: 2 });
        assert_eq!(ladder.decide(2), Escalation::Retry { next_attempt: 3 });
        assert_eq!(ladder.decide(3), Escalation::DeadLetter { attempt: 3 });
    }

    #[test]
    fn attempts_beyond_the_limit_go_straight_to_failed() {
        let ladder = RetryLadder::new(5);
        assert_eq!(ladder.decide(9), Escalation::DeadLetter { attempt: 9 });
        assert_eq!(ladder.decide(u32::MAX), Escalation::DeadLetter { attempt: u32::MAX });
    }

    #[test]
    fn single_attempt_ladder_never_retries() {
        let ladder = RetryLadder::new(0);
        assert_eq!(ladder.max_attempts(), 1);
        assert_eq!(ladder.decide(1), Escalation::DeadLetter { attempt: 1 });
    }
}
