//! Processor port - ユーザーの処理関数
//!
//! 実行モード（同一プロセス / 隔離された executor）は transport の違いでしかありません。
//! Worker も retry policy も、どちらの実装が使われているかを知りません。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{JobId, JobRecord, ProcessError};

/// What a processor gets to see of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    /// Attempts finished before this one.
    pub attempts_made: u32,
    pub max_attempts: u32,
}

impl From<&JobRecord> for JobContext {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue.clone(),
            name: job.name.clone(),
            payload: job.payload.clone(),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
        }
    }
}

/// Processing function.
///
/// Return `ProcessError::Unrecoverable` to fail the job without spending the
/// remaining attempts. Any other error is retried while attempts remain.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessError>;
}
