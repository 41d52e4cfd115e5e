//! JobStore port - ジョブ状態の正本（source of truth）
//!
//! # 設計原則
//! - claim は compare-and-swap: 1 ジョブにつき有効な lease は常に 1 つ
//! - commit は lease id で fence する（古い lease の commit は `LeaseLost`）
//! - 同じ lease の commit を再送しても `Commit::Duplicate` が返るだけ
//! - 時刻（lease 期限、`ready_at`）は store 自身の Clock で決める

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    Commit, JobId, JobRecord, LeaseId, NewJob, QueueError, StallOutcome, Transition, WorkerId,
};
use crate::observability::QueueCounts;

/// A job taken away from a silent lease holder by stall recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct StalledJob {
    pub record: JobRecord,
    pub outcome: StallOutcome,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in Waiting.
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, QueueError>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError>;

    /// Claim the oldest eligible job of `queue` (Waiting, or DelayedRetry
    /// whose `ready_at` has passed). `None` when nothing is eligible.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: WorkerId,
        lease_for: Duration,
    ) -> Result<Option<JobRecord>, QueueError>;

    /// Claim one specific job. `ClaimConflict` if someone else holds it.
    async fn claim(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        lease_for: Duration,
    ) -> Result<JobRecord, QueueError>;

    /// Commit the end of an attempt. A `Retry` transition also schedules the
    /// job in the delayed set.
    async fn commit(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        transition: Transition,
    ) -> Result<Commit, QueueError>;

    async fn extend_lease(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        lease_for: Duration,
    ) -> Result<(), QueueError>;

    /// Give the job back (Active -> Waiting) without counting an attempt.
    async fn release_lease(&self, job_id: JobId, lease_id: LeaseId) -> Result<(), QueueError>;

    /// Move due DelayedRetry jobs back to Waiting.
    async fn promote_delayed(&self) -> Result<Vec<JobId>, QueueError>;

    /// Requeue (or fail, past `max_stalled_count`) Active jobs whose lease expired.
    async fn reclaim_stalled(&self, max_stalled_count: u32) -> Result<Vec<StalledJob>, QueueError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError>;

    /// Wait until `queue` may have work, or `timeout` elapses.
    async fn wait_for_work(&self, queue: &str, timeout: Duration);
}
