//! Retry policy evaluator.
//!
//! Pure: given the attempt count, the budget and the failure classification it
//! returns a [`RetryDecision`]. Applying the decision is the state machine's job.

use crate::domain::{FailureOutcome, JobRecord, RetryDecision};

use super::BackoffStrategy;

/// Decides the next step for a job whose attempt just failed.
///
/// Implementations must be side-effect free; the lifecycle may call them more
/// than once for the same input.
pub trait Decider: Send + Sync {
    fn decide(&self, job: &JobRecord, outcome: &FailureOutcome) -> RetryDecision;
}

/// Default policy: attempts budget plus a backoff strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Used when the job carries no backoff of its own.
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffStrategy) -> Self {
        Self { backoff }
    }

    /// The retry rule itself.
    ///
    /// - `Unrecoverable` is always `Exhausted`, whatever budget is left.
    /// - `Recoverable` counts the attempt; `Exhausted` once the count reaches
    ///   `max_attempts`, otherwise `Retry` after the backoff delay.
    pub fn evaluate(
        attempts_made: u32,
        max_attempts: u32,
        backoff: &BackoffStrategy,
        outcome: &FailureOutcome,
    ) -> RetryDecision {
        if outcome.is_unrecoverable() {
            return RetryDecision::Exhausted;
        }
        let attempts_made = attempts_made.saturating_add(1);
        if attempts_made >= max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: backoff.delay_for(attempts_made),
            }
        }
    }
}

impl Decider for RetryPolicy {
    fn decide(&self, job: &JobRecord, outcome: &FailureOutcome) -> RetryDecision {
        let backoff = job.backoff.as_ref().unwrap_or(&self.backoff);
        Self::evaluate(job.attempts_made, job.max_attempts, backoff, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, NewJob};
    use chrono::Utc;
    use rstest::rstest;
    use std::time::Duration;
    use ulid::Ulid;

    #[rstest]
    #[case::first_attempt(0, 4)]
    #[case::middle_attempt(2, 4)]
    #[case::last_attempt(3, 4)]
    #[case::single_attempt(0, 1)]
    fn unrecoverable_always_exhausts(#[case] attempts_made: u32, #[case] max_attempts: u32) {
        let decision = RetryPolicy::evaluate(
            attempts_made,
            max_attempts,
            &BackoffStrategy::fixed(Duration::from_secs(10)),
            &FailureOutcome::unrecoverable("standard processor"),
        );
        assert_eq!(decision, RetryDecision::Exhausted);
    }

    #[rstest]
    #[case(0, 4, false)]
    #[case(2, 4, false)]
    #[case(3, 4, true)]
    #[case(0, 1, true)]
    fn recoverable_spends_the_budget(
        #[case] attempts_made: u32,
        #[case] max_attempts: u32,
        #[case] exhausted: bool,
    ) {
        let decision = RetryPolicy::evaluate(
            attempts_made,
            max_attempts,
            &BackoffStrategy::None,
            &FailureOutcome::recoverable("flaky"),
        );
        assert_eq!(decision.is_exhausted(), exhausted);
    }

    #[test]
    fn retry_delay_uses_the_incremented_count() {
        let decision = RetryPolicy::evaluate(
            1,
            5,
            &BackoffStrategy::exponential(Duration::from_millis(100)),
            &FailureOutcome::recoverable("flaky"),
        );
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_millis(200)
            }
        );
    }

    #[test]
    fn job_backoff_overrides_the_policy_default() {
        let policy = RetryPolicy::new(BackoffStrategy::fixed(Duration::from_secs(60)));
        let job = JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            NewJob {
                queue: "q".to_string(),
                name: "test".to_string(),
                payload: serde_json::Value::Null,
                max_attempts: 3,
                backoff: Some(BackoffStrategy::None),
                remove_on_complete: None,
                remove_on_fail: None,
            },
            Utc::now(),
        );

        let decision = policy.decide(&job, &FailureOutcome::recoverable("flaky"));
        assert_eq!(decision, RetryDecision::Retry { delay: Duration::ZERO });
    }
}
