//! Retry policy: backoff arithmetic and the retry decision.

mod backoff;
mod retry;

pub use backoff::BackoffStrategy;
pub use retry::{Decider, RetryPolicy};
