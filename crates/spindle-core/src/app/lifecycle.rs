//! Job lifecycle - 状態遷移の唯一の入口
//!
//! # 責務
//! - 処理結果（成功 / `FailureOutcome`）を Decider に通して `Transition` を決める
//! - `Transition` を lease 付きで store に commit する
//! - 実際に適用された commit についてだけイベントを publish する
//!   （`Commit::Duplicate` は何も publish しない）

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{
    Commit, FailureOutcome, JobId, JobRecord, JobState, LeaseId, LifecycleEvent, QueueError,
    RetryDecision, Transition, WorkerId,
};
use crate::policy::Decider;
use crate::ports::JobStore;

use super::notifier::EventNotifier;

pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    decider: Arc<dyn Decider>,
    notifier: EventNotifier,
}

impl JobLifecycle {
    pub fn new(store: Arc<dyn JobStore>, decider: Arc<dyn Decider>, notifier: EventNotifier) -> Self {
        Self {
            store,
            decider,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Waiting -> Active for one specific job.
    pub async fn claim(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        lease_for: Duration,
    ) -> Result<JobRecord, QueueError> {
        let job = self.store.claim(job_id, worker_id, lease_for).await?;
        tracing::debug!(job_id = %job.id, worker = %worker_id, attempt = job.attempts_made + 1, "job claimed");
        Ok(job)
    }

    /// Waiting -> Active for the oldest eligible job of `queue`.
    pub async fn claim_next(
        &self,
        queue: &str,
        worker_id: WorkerId,
        lease_for: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        let job = self.store.claim_next(queue, worker_id, lease_for).await?;
        if let Some(job) = &job {
            tracing::debug!(job_id = %job.id, worker = %worker_id, attempt = job.attempts_made + 1, "job claimed");
        }
        Ok(job)
    }

    /// Active -> Completed.
    pub async fn report_success(
        &self,
        job: &JobRecord,
        return_value: serde_json::Value,
    ) -> Result<Commit, QueueError> {
        let lease_id = self.held_lease(job, "complete")?;
        let commit = self
            .commit(job.id, lease_id, Transition::Complete { return_value })
            .await?;

        if let Commit::Applied(record) = &commit {
            tracing::info!(job_id = %record.id, attempts_made = record.attempts_made, "job completed");
            self.notifier.publish(LifecycleEvent::Completed {
                queue: record.queue.clone(),
                job_id: record.id,
                attempts_made: record.attempts_made,
                return_value: record.return_value.clone().unwrap_or_default(),
            });
        }
        Ok(commit)
    }

    /// Active -> DelayedRetry | Failed, as the decider says.
    pub async fn report_failure(
        &self,
        job: &JobRecord,
        outcome: FailureOutcome,
    ) -> Result<Commit, QueueError> {
        let lease_id = self.held_lease(job, "fail")?;
        let reason = outcome.reason().to_string();
        let transition = match self.decider.decide(job, &outcome) {
            RetryDecision::Retry { delay } => Transition::Retry { delay, reason },
            RetryDecision::Exhausted => Transition::Fail {
                reason,
                unrecoverable: outcome.is_unrecoverable(),
            },
        };

        let commit = self.commit(job.id, lease_id, transition).await?;
        if let Commit::Applied(record) = &commit {
            self.publish_failure(record);
        }
        Ok(commit)
    }

    fn publish_failure(&self, record: &JobRecord) {
        let reason = record.failed_reason.clone().unwrap_or_default();
        self.notifier.publish(LifecycleEvent::Failed {
            queue: record.queue.clone(),
            job_id: record.id,
            attempts_made: record.attempts_made,
            reason: reason.clone(),
        });

        if record.state == JobState::Failed {
            tracing::info!(
                job_id = %record.id,
                attempts_made = record.attempts_made,
                unrecoverable = record.unrecoverable,
                %reason,
                "job failed, retries exhausted"
            );
            self.notifier.publish(LifecycleEvent::RetriesExhausted {
                queue: record.queue.clone(),
                job_id: record.id,
                attempts_made: record.attempts_made,
                reason,
            });
        } else {
            tracing::debug!(
                job_id = %record.id,
                attempts_made = record.attempts_made,
                ready_at = ?record.ready_at,
                %reason,
                "retry scheduled"
            );
        }
    }

    async fn commit(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        transition: Transition,
    ) -> Result<Commit, QueueError> {
        match self.store.commit(job_id, lease_id, transition).await {
            Ok(Commit::Duplicate(record)) => {
                tracing::debug!(%job_id, %lease_id, state = %record.state, "duplicate commit ignored");
                Ok(Commit::Duplicate(record))
            }
            Ok(commit) => Ok(commit),
            Err(err @ QueueError::InvalidTransition { .. }) => {
                tracing::error!(%job_id, %lease_id, error = %err, "rejected transition");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn held_lease(&self, job: &JobRecord, action: &'static str) -> Result<LeaseId, QueueError> {
        job.lease_id().ok_or(QueueError::InvalidTransition {
            job_id: job.id,
            from: job.state,
            action,
        })
    }
}
