//! Errors - エラー型と分類
//!
//! 処理失敗（`FailureOutcome`）はエラーではなく、ジョブ状態を動かす入力です。
//! ここにあるのはインフラ層・プログラミング上のエラーだけで、ジョブ状態を
//! 勝手に書き換えることはありません。

use thiserror::Error;

use super::ids::{JobId, LeaseId, WorkerId};
use super::job::JobState;

/// Errors raised by the store and the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Another worker holds the lease. Claim something else.
    #[error("job {job_id} is already claimed by {holder}")]
    ClaimConflict { job_id: JobId, holder: WorkerId },

    /// The requested transition is not allowed from the current state.
    #[error("invalid transition for job {job_id}: cannot {action} from {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        action: &'static str,
    },

    /// The lease was reclaimed or released; the commit is stale.
    #[error("lease {lease_id} is no longer held on job {job_id}")]
    LeaseLost { job_id: JobId, lease_id: LeaseId },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// Transient store failure. Back off and try again.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl QueueError {
    /// Worth retrying at the infrastructure layer?
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }
}

/// Failure reported by an event listener. Logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
