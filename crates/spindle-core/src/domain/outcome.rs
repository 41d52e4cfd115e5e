//! Outcome model: how a failed attempt is classified.
//!
//! This module does not know about stores or workers. A processor returns a
//! [`ProcessError`]; the worker turns it into a [`FailureOutcome`], which is the
//! only input the retry policy looks at.

use std::any::Any;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// The attempt may be retried if the attempts budget allows it.
    Recoverable(String),

    /// Retrying is pointless. Exhausts the job immediately.
    Unrecoverable(String),
}

impl FailureOutcome {
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self::Recoverable(reason.into())
    }

    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self::Unrecoverable(reason.into())
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Recoverable(reason) | Self::Unrecoverable(reason) => reason,
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

/// Error returned by a processing function.
///
/// Only [`ProcessError::Unrecoverable`] bypasses the remaining attempts.
/// Anything else, including a panic, counts as a recoverable failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("{0}")]
    Unrecoverable(String),

    #[error("{0}")]
    Failed(String),

    #[error("processor panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Build from a panic payload caught at a task boundary.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

impl From<ProcessError> for FailureOutcome {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Unrecoverable(message) => FailureOutcome::Unrecoverable(message),
            other => FailureOutcome::Recoverable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::unrecoverable(ProcessError::unrecoverable("bad input"), FailureOutcome::unrecoverable("bad input"))]
    #[case::failed(ProcessError::failed("timeout"), FailureOutcome::recoverable("timeout"))]
    #[case::panicked(
        ProcessError::Panicked("boom".to_string()),
        FailureOutcome::recoverable("processor panicked: boom")
    )]
    fn process_errors_are_classified(#[case] err: ProcessError, #[case] expected: FailureOutcome) {
        assert_eq!(FailureOutcome::from(err), expected);
    }

    #[test]
    fn panic_payloads_keep_their_message() {
        let err = ProcessError::from_panic(Box::new("static str"));
        assert_eq!(err, ProcessError::Panicked("static str".to_string()));

        let err = ProcessError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err, ProcessError::Panicked("owned".to_string()));

        let err = ProcessError::from_panic(Box::new(42_u8));
        assert!(matches!(err, ProcessError::Panicked(_)));
    }

    #[test]
    fn failure_outcome_is_tagged_enum() {
        let v = serde_json::to_value(FailureOutcome::unrecoverable("nope")).unwrap();
        assert_eq!(v["kind"], "unrecoverable");
        assert_eq!(v["reason"], "nope");
    }
}
