//! Backoff strategies: how long a recoverable failure waits before the retry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy.
///
/// Serialized as `{"type": "fixed", "delay_ms": 1000}` and friends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Retry immediately.
    #[default]
    None,

    /// Same delay before every retry.
    Fixed { delay_ms: u64 },

    /// `delay_ms * 2^(attempts_made - 1)`.
    Exponential { delay_ms: u64 },
}

impl BackoffStrategy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: millis(delay),
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            delay_ms: millis(base),
        }
    }

    /// Delay before the next retry.
    ///
    /// # Arguments
    /// * `attempts_made` - Finished attempts, including the one that just failed (1-indexed).
    ///
    /// Example with exponential base=1s:
    /// - attempt 1 failed: 1s
    /// - attempt 2 failed: 2s
    /// - attempt 3 failed: 4s
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffStrategy::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1);
                let factor = 1_u64.checked_shl(exponent).unwrap_or(u64::MAX);
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_is_immediate() {
        assert_eq!(BackoffStrategy::default().delay_for(3), Duration::ZERO);
    }

    #[rstest]
    #[case(1, 1_000)]
    #[case(2, 1_000)]
    #[case(7, 1_000)]
    fn fixed_backoff_is_constant(#[case] attempts_made: u32, #[case] expected_ms: u64) {
        let backoff = BackoffStrategy::fixed(Duration::from_secs(1));
        assert_eq!(
            backoff.delay_for(attempts_made),
            Duration::from_millis(expected_ms)
        );
    }

    #[rstest]
    #[case(0, 500)]
    #[case(1, 500)]
    #[case(2, 1_000)]
    #[case(3, 2_000)]
    #[case(4, 4_000)]
    fn exponential_backoff_doubles(#[case] attempts_made: u32, #[case] expected_ms: u64) {
        let backoff = BackoffStrategy::exponential(Duration::from_millis(500));
        assert_eq!(
            backoff.delay_for(attempts_made),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn exponential_backoff_saturates() {
        let backoff = BackoffStrategy::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay_for(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn backoff_is_tagged_by_type() {
        let parsed: BackoffStrategy =
            serde_json::from_str(r#"{"type": "exponential", "delay_ms": 250}"#).unwrap();
        assert_eq!(parsed, BackoffStrategy::exponential(Duration::from_millis(250)));

        let parsed: BackoffStrategy = serde_json::from_str(r#"{"type": "none"}"#).unwrap();
        assert_eq!(parsed, BackoffStrategy::None);
    }
}
