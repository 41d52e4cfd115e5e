//! Decision model: what happens to a job after a failed attempt.

use std::time::Duration;

/// Output of the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the job in DelayedRetry, eligible again after `delay`.
    Retry { delay: Duration },

    /// No attempts left (or the failure was unrecoverable). The job fails.
    Exhausted,
}

impl RetryDecision {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryDecision::Exhausted)
    }
}
