//! In-memory job store.
//!
//! Development/test stand-in for the external store. Every operation runs
//! under one async mutex, which is what makes claim a compare-and-swap.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::job::deadline;
use crate::domain::{
    Commit, JobId, JobRecord, JobState, Lease, LeaseId, NewJob, QueueError, StallOutcome,
    Transition, WorkerId,
};
use crate::observability::QueueCounts;
use crate::ports::{Clock, IdGenerator, JobStore, StalledJob, SystemClock, UlidGenerator};

/// Delayed-set entry.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledJob {
    ready_at: DateTime<Utc>,
    job_id: JobId,
}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

/// Finished jobs per queue, oldest first. Only used to enforce retention.
#[derive(Default)]
struct Finished {
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

#[derive(Default)]
struct StoreState {
    /// All job records.
    jobs: HashMap<JobId, JobRecord>,

    /// Waiting list per queue (JobIds only, oldest first).
    waiting: HashMap<String, VecDeque<JobId>>,

    /// DelayedRetry jobs ordered by `ready_at`.
    delayed: BinaryHeap<ScheduledJob>,

    finished: HashMap<String, Finished>,

    /// One wakeup per queue, so an enqueue never wakes a worker of another queue.
    wakers: HashMap<String, Arc<Notify>>,
}

impl StoreState {
    fn waker(&mut self, queue: &str) -> Arc<Notify> {
        Arc::clone(self.wakers.entry(queue.to_string()).or_default())
    }

    /// Append to the waiting list and wake one worker of that queue.
    fn push_waiting(&mut self, queue: &str, job_id: JobId, front: bool) {
        let ids = self.waiting.entry(queue.to_string()).or_default();
        if front {
            ids.push_front(job_id);
        } else {
            ids.push_back(job_id);
        }
        self.waker(queue).notify_one();
    }

    fn promote_due(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut promoted = Vec::new();
        while let Some(entry) = self.delayed.peek() {
            if entry.ready_at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            let Some(record) = self.jobs.get_mut(&entry.job_id) else {
                continue;
            };
            if record.state == JobState::DelayedRetry && record.promote(now).is_ok() {
                let queue = record.queue.clone();
                self.push_waiting(&queue, entry.job_id, false);
                promoted.push(entry.job_id);
            }
        }
        promoted
    }

    /// Pop the oldest claimable id, skipping entries that went stale.
    fn pop_waiting(&mut self, queue: &str) -> Option<JobId> {
        let ids = self.waiting.get_mut(queue)?;
        while let Some(id) = ids.pop_front() {
            if self
                .jobs
                .get(&id)
                .is_some_and(|record| record.state.is_claimable())
            {
                return Some(id);
            }
        }
        None
    }

    /// Record a finished job and drop the oldest ones past its retention limit.
    fn retire(&mut self, job_id: JobId) {
        let Some(record) = self.jobs.get(&job_id) else {
            return;
        };
        let limit = record.retention_limit();
        let finished = self.finished.entry(record.queue.clone()).or_default();
        let ids = match record.state {
            JobState::Completed => &mut finished.completed,
            JobState::Failed => &mut finished.failed,
            _ => return,
        };
        ids.push_back(job_id);

        if let Some(keep) = limit {
            while ids.len() > keep {
                if let Some(old) = ids.pop_front() {
                    self.jobs.remove(&old);
                }
            }
        }
    }

    fn record_mut(&mut self, job_id: JobId) -> Result<&mut JobRecord, QueueError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))
    }
}

/// In-memory [`JobStore`].
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
}

impl InMemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
        }
    }

    fn lease(&self, worker_id: WorkerId, lease_for: Duration, now: DateTime<Utc>) -> Lease {
        Lease {
            lease_id: self.ids.generate_lease_id(),
            worker_id,
            expires_at: deadline(now, lease_for),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, QueueError> {
        let mut state = self.state.lock().await;
        let record = JobRecord::new(self.ids.generate_job_id(), job, self.clock.now());
        state.jobs.insert(record.id, record.clone());
        state.push_waiting(&record.queue, record.id, false);
        Ok(record)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: WorkerId,
        lease_for: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state.promote_due(now);

        let Some(job_id) = state.pop_waiting(queue) else {
            return Ok(None);
        };
        let lease = self.lease(worker_id, lease_for, now);
        let record = state.record_mut(job_id)?;
        record.activate(lease, now)?;
        Ok(Some(record.clone()))
    }

    async fn claim(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        lease_for: Duration,
    ) -> Result<JobRecord, QueueError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state.promote_due(now);

        let lease = self.lease(worker_id, lease_for, now);
        let record = state.record_mut(job_id)?;
        record.activate(lease, now)?;
        let record = record.clone();

        if let Some(ids) = state.waiting.get_mut(&record.queue) {
            ids.retain(|id| *id != job_id);
        }
        Ok(record)
    }

    async fn commit(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        transition: Transition,
    ) -> Result<Commit, QueueError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let commit = state.record_mut(job_id)?.apply(lease_id, &transition, now)?;

        if let Commit::Applied(record) = &commit {
            match record.state {
                JobState::DelayedRetry => {
                    if let Some(ready_at) = record.ready_at {
                        state.delayed.push(ScheduledJob { ready_at, job_id });
                    }
                    // Wake a worker so it recomputes its wait against the new ready_at.
                    state.waker(&record.queue).notify_one();
                }
                JobState::Completed | JobState::Failed => state.retire(job_id),
                _ => {}
            }
        }
        Ok(commit)
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        lease_for: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state
            .record_mut(job_id)?
            .extend_lease(lease_id, lease_for, now)
    }

    async fn release_lease(&self, job_id: JobId, lease_id: LeaseId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let record = state.record_mut(job_id)?;
        record.release(lease_id, now)?;
        let queue = record.queue.clone();
        state.push_waiting(&queue, job_id, true);
        Ok(())
    }

    async fn promote_delayed(&self) -> Result<Vec<JobId>, QueueError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        Ok(state.promote_due(now))
    }

    async fn reclaim_stalled(&self, max_stalled_count: u32) -> Result<Vec<StalledJob>, QueueError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let mut expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|record| record.is_lease_expired(now))
            .map(|record| record.id)
            .collect();
        expired.sort();

        let mut stalled = Vec::with_capacity(expired.len());
        for job_id in expired {
            let record = state.record_mut(job_id)?;
            let outcome = record.mark_stalled(max_stalled_count, now)?;
            let record = record.clone();
            match outcome {
                StallOutcome::Requeued => state.push_waiting(&record.queue, job_id, false),
                StallOutcome::Failed => state.retire(job_id),
            }
            stalled.push(StalledJob { record, outcome });
        }
        Ok(stalled)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.jobs.values().filter(|record| record.queue == queue) {
            counts.record(record.state);
        }
        Ok(counts)
    }

    async fn wait_for_work(&self, queue: &str, timeout: Duration) {
        // Wake early if a delayed job comes due before the timeout.
        let (waker, wait) = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let wait = state.delayed.peek().map_or(timeout, |entry| {
                (entry.ready_at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(timeout)
            });
            (state.waker(queue), wait)
        };

        tokio::select! {
            _ = waker.notified() => {},
            _ = tokio::time::sleep(wait) => {},
        }
    }
}
