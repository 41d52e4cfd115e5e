//! Job record and its state machine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::errors::QueueError;
use super::ids::{JobId, LeaseId, WorkerId};
use crate::policy::BackoffStrategy;

/// Job state.
///
/// State transitions:
/// - Waiting -> Active -> Completed
/// - Waiting -> Active -> DelayedRetry -> Waiting (loop while attempts remain)
/// - Waiting -> Active -> Failed (unrecoverable, or attempts exhausted)
/// - Waiting -> Active -> Waiting (lease released or stalled; attempt not counted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,

    /// Leased by exactly one worker.
    Active,

    /// Failed recoverably; eligible again at `ready_at`.
    DelayedRetry,

    Completed,

    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn is_claimable(self) -> bool {
        matches!(self, JobState::Waiting)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::DelayedRetry => "delayed_retry",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-job overrides of the queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum attempts, including the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffStrategy>,

    /// Keep at most this many completed jobs of the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<usize>,

    /// Keep at most this many failed jobs of the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<usize>,
}

impl JobOptions {
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn remove_on_complete(mut self, keep: usize) -> Self {
        self.remove_on_complete = Some(keep);
        self
    }

    pub fn remove_on_fail(mut self, keep: usize) -> Self {
        self.remove_on_fail = Some(keep);
        self
    }
}

/// Input for `JobStore::enqueue`. Defaults are already resolved.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub backoff: Option<BackoffStrategy>,
    /// `None` keeps every finished job.
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
}

/// Exclusive processing right on one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub worker_id: WorkerId,
    pub expires_at: DateTime<Utc>,
}

/// What a lease holder commits at the end of an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Complete { return_value: serde_json::Value },
    Retry { delay: Duration, reason: String },
    Fail { reason: String, unrecoverable: bool },
}

impl Transition {
    fn action(&self) -> &'static str {
        match self {
            Transition::Complete { .. } => "complete",
            Transition::Retry { .. } => "retry",
            Transition::Fail { .. } => "fail",
        }
    }
}

/// Result of a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    /// The transition landed. Carries the record after the change.
    Applied(JobRecord),

    /// The same lease already committed. Nothing changed.
    Duplicate(JobRecord),
}

impl Commit {
    pub fn record(&self) -> &JobRecord {
        match self {
            Commit::Applied(record) | Commit::Duplicate(record) => record,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Commit::Applied(_))
    }
}

/// What stall recovery did with an expired lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    Requeued,
    Failed,
}

/// Reason recorded when a job exceeds the stall limit.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Job record: the single source of truth for one job.
///
/// All state changes go through the methods below, which enforce the
/// transition table and the `attempts_made <= max_attempts` invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,

    /// Finished attempts (successful or not).
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub state: JobState,

    pub failed_reason: Option<String>,

    /// Set when the job failed because of an unrecoverable error.
    pub unrecoverable: bool,

    pub return_value: Option<serde_json::Value>,

    /// Per-job backoff override.
    pub backoff: Option<BackoffStrategy>,

    /// Present only while Active.
    pub lease: Option<Lease>,

    /// Lease of the last committed attempt, used to spot replayed commits.
    pub last_committed_lease: Option<LeaseId>,

    /// When a DelayedRetry job becomes eligible again.
    pub ready_at: Option<DateTime<Utc>>,

    pub stalled_count: u32,

    /// Retention limits, applied by the store when the job finishes.
    #[serde(default)]
    pub remove_on_complete: Option<usize>,
    #[serde(default)]
    pub remove_on_fail: Option<usize>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: JobId, job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            queue: job.queue,
            name: job.name,
            payload: job.payload,
            attempts_made: 0,
            max_attempts: job.max_attempts.max(1),
            state: JobState::Waiting,
            failed_reason: None,
            unrecoverable: false,
            return_value: None,
            backoff: job.backoff,
            lease: None,
            last_committed_lease: None,
            ready_at: None,
            stalled_count: 0,
            remove_on_complete: job.remove_on_complete,
            remove_on_fail: job.remove_on_fail,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// How many finished jobs like this one the queue keeps, if limited.
    pub fn retention_limit(&self) -> Option<usize> {
        match self.state {
            JobState::Completed => self.remove_on_complete,
            JobState::Failed => self.remove_on_fail,
            _ => None,
        }
    }

    /// Lease id while Active.
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease.as_ref().map(|lease| lease.lease_id)
    }

    /// Waiting -> Active.
    pub fn activate(&mut self, lease: Lease, now: DateTime<Utc>) -> Result<(), QueueError> {
        match self.state {
            JobState::Waiting => {
                self.state = JobState::Active;
                self.lease = Some(lease);
                self.ready_at = None;
                self.updated_at = now;
                Ok(())
            }
            JobState::Active => Err(QueueError::ClaimConflict {
                job_id: self.id,
                holder: self
                    .lease
                    .as_ref()
                    .map(|lease| lease.worker_id)
                    .unwrap_or(lease.worker_id),
            }),
            from => Err(self.invalid(from, "claim")),
        }
    }

    /// Active -> Completed | DelayedRetry | Failed, fenced by `lease_id`.
    pub fn apply(
        &mut self,
        lease_id: LeaseId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Commit, QueueError> {
        if self.last_committed_lease == Some(lease_id) {
            return Ok(Commit::Duplicate(self.clone()));
        }
        self.check_lease(lease_id, transition.action())?;

        self.attempts_made = self.attempts_made.saturating_add(1);
        self.lease = None;
        self.last_committed_lease = Some(lease_id);
        self.updated_at = now;

        // A retry past the budget fails the job instead, whatever the decider said.
        let exhausted;
        let transition = match transition {
            Transition::Retry { reason, .. } if self.attempts_made >= self.max_attempts => {
                exhausted = Transition::Fail {
                    reason: reason.clone(),
                    unrecoverable: false,
                };
                &exhausted
            }
            other => other,
        };

        match transition {
            Transition::Complete { return_value } => {
                self.state = JobState::Completed;
                self.return_value = Some(return_value.clone());
                self.finished_at = Some(now);
            }
            Transition::Retry { delay, reason } => {
                self.state = JobState::DelayedRetry;
                self.failed_reason = Some(reason.clone());
                self.ready_at = Some(deadline(now, *delay));
            }
            Transition::Fail {
                reason,
                unrecoverable,
            } => {
                self.state = JobState::Failed;
                self.failed_reason = Some(reason.clone());
                self.unrecoverable = *unrecoverable;
                self.finished_at = Some(now);
            }
        }
        Ok(Commit::Applied(self.clone()))
    }

    /// Push the lease expiry forward.
    pub fn extend_lease(
        &mut self,
        lease_id: LeaseId,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.check_lease(lease_id, "extend lease")?;
        if let Some(lease) = self.lease.as_mut() {
            lease.expires_at = deadline(now, lease_for);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Active -> Waiting without counting an attempt.
    pub fn release(&mut self, lease_id: LeaseId, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.check_lease(lease_id, "release")?;
        self.state = JobState::Waiting;
        self.lease = None;
        self.updated_at = now;
        Ok(())
    }

    /// DelayedRetry -> Waiting.
    pub fn promote(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        if self.state != JobState::DelayedRetry {
            return Err(self.invalid(self.state, "promote"));
        }
        self.state = JobState::Waiting;
        self.ready_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Expired lease: back to Waiting, or Failed past the stall limit.
    pub fn mark_stalled(
        &mut self,
        max_stalled_count: u32,
        now: DateTime<Utc>,
    ) -> Result<StallOutcome, QueueError> {
        if self.state != JobState::Active {
            return Err(self.invalid(self.state, "reclaim"));
        }
        self.lease = None;
        self.stalled_count += 1;
        self.updated_at = now;

        if self.stalled_count > max_stalled_count {
            self.state = JobState::Failed;
            self.failed_reason = Some(STALLED_REASON.to_string());
            self.finished_at = Some(now);
            Ok(StallOutcome::Failed)
        } else {
            self.state = JobState::Waiting;
            Ok(StallOutcome::Requeued)
        }
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active
            && self
                .lease
                .as_ref()
                .is_some_and(|lease| lease.expires_at <= now)
    }

    fn check_lease(&self, lease_id: LeaseId, action: &'static str) -> Result<(), QueueError> {
        match (&self.state, self.lease_id()) {
            (JobState::Active, Some(held)) if held == lease_id => Ok(()),
            (state, _) if state.is_terminal() => Err(self.invalid(*state, action)),
            _ => Err(QueueError::LeaseLost {
                job_id: self.id,
                lease_id,
            }),
        }
    }

    fn invalid(&self, from: JobState, action: &'static str) -> QueueError {
        QueueError::InvalidTransition {
            job_id: self.id,
            from,
            action,
        }
    }
}

/// `now + d`, saturating at the largest representable time.
pub fn deadline(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn record(max_attempts: u32) -> JobRecord {
        JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            NewJob {
                queue: "q".to_string(),
                name: "test".to_string(),
                payload: serde_json::json!({"foo": "bar"}),
                max_attempts,
                backoff: None,
                remove_on_complete: None,
                remove_on_fail: None,
            },
            t0(),
        )
    }

    fn lease(secs: i64) -> Lease {
        Lease {
            lease_id: LeaseId::from_ulid(Ulid::new()),
            worker_id: WorkerId::from_ulid(Ulid::new()),
            expires_at: t0() + TimeDelta::seconds(secs),
        }
    }

    fn active(max_attempts: u32) -> (JobRecord, LeaseId) {
        let mut job = record(max_attempts);
        let lease = lease(30);
        let lease_id = lease.lease_id;
        job.activate(lease, t0()).unwrap();
        (job, lease_id)
    }

    #[test]
    fn new_job_starts_waiting() {
        let job = record(4);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert!(!job.unrecoverable);
    }

    #[test]
    fn zero_max_attempts_is_clamped_to_one() {
        assert_eq!(record(0).max_attempts, 1);
    }

    #[test]
    fn second_claim_conflicts() {
        let (mut job, _) = active(2);
        let err = job.activate(lease(30), t0()).unwrap_err();
        assert!(matches!(err, QueueError::ClaimConflict { .. }));
    }

    #[test]
    fn complete_counts_the_attempt() {
        let (mut job, lease_id) = active(3);
        let commit = job
            .apply(
                lease_id,
                &Transition::Complete {
                    return_value: serde_json::json!(42),
                },
                t0(),
            )
            .unwrap();

        assert!(commit.is_applied());
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.return_value, Some(serde_json::json!(42)));
        assert!(job.lease.is_none());
    }

    #[test]
    fn retry_sets_ready_at() {
        let (mut job, lease_id) = active(3);
        job.apply(
            lease_id,
            &Transition::Retry {
                delay: Duration::from_secs(5),
                reason: "flaky".to_string(),
            },
            t0(),
        )
        .unwrap();

        assert_eq!(job.state, JobState::DelayedRetry);
        assert_eq!(job.ready_at, Some(t0() + TimeDelta::seconds(5)));
        assert_eq!(job.failed_reason.as_deref(), Some("flaky"));

        job.promote(t0()).unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.ready_at, None);
    }

    #[test]
    fn retry_on_the_last_attempt_fails_the_job() {
        let (mut job, lease_id) = active(2);
        let retry = Transition::Retry {
            delay: Duration::ZERO,
            reason: "flaky".to_string(),
        };

        job.apply(lease_id, &retry, t0()).unwrap();
        job.promote(t0()).unwrap();
        let lease = lease(30);
        let second = lease.lease_id;
        job.activate(lease, t0()).unwrap();
        job.apply(second, &retry, t0()).unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
        assert!(!job.unrecoverable);
        assert_eq!(job.failed_reason.as_deref(), Some("flaky"));
        assert_eq!(job.ready_at, None);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn retention_limit_follows_the_terminal_state() {
        let mut job = record(1);
        job.remove_on_complete = Some(10);
        job.remove_on_fail = Some(3);
        assert_eq!(job.retention_limit(), None);

        let lease = lease(30);
        let lease_id = lease.lease_id;
        job.activate(lease, t0()).unwrap();
        job.apply(
            lease_id,
            &Transition::Fail {
                reason: "x".to_string(),
                unrecoverable: true,
            },
            t0(),
        )
        .unwrap();
        assert_eq!(job.retention_limit(), Some(3));
    }

    #[test]
    fn replayed_commit_is_a_duplicate() {
        let (mut job, lease_id) = active(4);
        let fail = Transition::Fail {
            reason: "standard processor".to_string(),
            unrecoverable: true,
        };

        assert!(job.apply(lease_id, &fail, t0()).unwrap().is_applied());
        let again = job.apply(lease_id, &fail, t0()).unwrap();

        assert!(matches!(again, Commit::Duplicate(_)));
        assert_eq!(job.attempts_made, 1);
        assert!(job.unrecoverable);
    }

    #[rstest]
    #[case::claim("claim")]
    #[case::release("release")]
    #[case::commit("commit")]
    fn terminal_states_reject_transitions(#[case] action: &str) {
        let (mut job, lease_id) = active(1);
        job.apply(
            lease_id,
            &Transition::Fail {
                reason: "x".to_string(),
                unrecoverable: false,
            },
            t0(),
        )
        .unwrap();

        let other = LeaseId::from_ulid(Ulid::new());
        let err = match action {
            "claim" => job.activate(lease(30), t0()).unwrap_err(),
            "release" => job.release(other, t0()).unwrap_err(),
            _ => job
                .apply(
                    other,
                    &Transition::Complete {
                        return_value: serde_json::Value::Null,
                    },
                    t0(),
                )
                .unwrap_err(),
        };
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: JobState::Failed,
                ..
            }
        ));
    }

    #[test]
    fn stale_lease_is_rejected() {
        let (mut job, lease_id) = active(3);
        job.release(lease_id, t0()).unwrap();
        job.activate(lease(30), t0()).unwrap();

        let err = job
            .apply(
                lease_id,
                &Transition::Complete {
                    return_value: serde_json::Value::Null,
                },
                t0(),
            )
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));
        assert_eq!(job.attempts_made, 0);
    }

    #[test]
    fn stalls_requeue_until_the_limit() {
        let (mut job, _) = active(3);
        assert_eq!(job.mark_stalled(1, t0()).unwrap(), StallOutcome::Requeued);
        assert_eq!(job.state, JobState::Waiting);

        job.activate(lease(30), t0()).unwrap();
        assert_eq!(job.mark_stalled(1, t0()).unwrap(), StallOutcome::Failed);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_REASON));
        assert_eq!(job.attempts_made, 0);
    }

    #[test]
    fn lease_expiry_is_inclusive() {
        let (job, _) = active(1);
        assert!(!job.is_lease_expired(t0()));
        assert!(job.is_lease_expired(t0() + TimeDelta::seconds(30)));
    }

    #[test]
    fn deadline_saturates() {
        assert_eq!(deadline(t0(), Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
