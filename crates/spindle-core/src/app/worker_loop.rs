//! Worker loop - claim → process → report
//!
//! # 流れ
//! 1. semaphore の permit を取る（同時実行数 = `concurrency`）
//! 2. `claim_next` で lease を取る。なければ `wait_for_work` で待つ
//! 3. 処理は別 task で実行し、その間 lease を半分の期間ごとに延長する
//! 4. 結果を lifecycle に報告（panic は recoverable な失敗として扱う）
//!
//! `close(grace)` は claim を即座に止め、grace 内に終わらなかった処理を abort して
//! lease を返却します（attempt は数えない）。abort した処理が止まるまで待ってから返ります。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::QueueConfig;
use crate::domain::{FailureOutcome, JobId, JobRecord, LeaseId, ProcessError, QueueError, WorkerId};
use crate::ports::{JobContext, Processor};

use super::lifecycle::JobLifecycle;

/// Knobs a worker takes from the queue config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub close_grace: Duration,
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            lease_duration: config.lease_duration(),
            poll_interval: config.poll_interval(),
            close_grace: config.close_grace(),
        }
    }
}

struct InFlight {
    lease_id: LeaseId,
    abort: AbortHandle,
    attempt: JoinHandle<()>,
}

struct Shared {
    id: WorkerId,
    queue: String,
    lifecycle: Arc<JobLifecycle>,
    processor: Arc<dyn Processor>,
    semaphore: Arc<Semaphore>,
    settings: WorkerSettings,
    in_flight: Mutex<HashMap<JobId, InFlight>>,
}

impl Shared {
    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle of a running worker.
///
/// Dropping the handle without `close` stops claiming but leaves in-flight
/// attempts running to completion.
pub struct Worker {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl Worker {
    /// Start claiming from `queue`. Must be called from within a Tokio runtime.
    pub fn spawn(
        id: WorkerId,
        queue: impl Into<String>,
        lifecycle: Arc<JobLifecycle>,
        processor: Arc<dyn Processor>,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id,
            queue: queue.into(),
            lifecycle,
            processor,
            semaphore: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            settings,
            in_flight: Mutex::new(HashMap::new()),
        });

        let join = tokio::spawn(run(Arc::clone(&shared), shutdown_rx));
        Self {
            shared,
            shutdown_tx,
            join,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// Jobs currently being processed.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight().len()
    }

    /// `close` with the configured grace period.
    pub async fn shutdown(self) {
        let grace = self.shared.settings.close_grace;
        self.close(grace).await;
    }

    /// Stop claiming, wait up to `grace` for in-flight attempts, then abort
    /// what is left and release those leases.
    pub async fn close(self, grace: Duration) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;

        let shared = self.shared;
        let all = u32::try_from(shared.settings.concurrency.max(1)).unwrap_or(u32::MAX);
        if tokio::time::timeout(grace, shared.semaphore.acquire_many(all))
            .await
            .is_err()
        {
            let abandoned: Vec<(JobId, InFlight)> = shared.in_flight().drain().collect();
            for (_, in_flight) in &abandoned {
                in_flight.abort.abort();
            }
            for (job_id, in_flight) in abandoned {
                // 処理が本当に止まってから lease を返す
                let _ = in_flight.attempt.await;
                match shared
                    .lifecycle
                    .store()
                    .release_lease(job_id, in_flight.lease_id)
                    .await
                {
                    Ok(()) => tracing::info!(worker = %shared.id, %job_id, "attempt aborted, lease released"),
                    // The attempt committed in the meantime, or the lease was reclaimed.
                    Err(err) => tracing::debug!(worker = %shared.id, %job_id, error = %err, "lease not released"),
                }
            }
        }

        tracing::info!(worker = %shared.id, queue = %shared.queue, "worker closed");
    }
}

async fn run(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    tracing::info!(
        worker = %shared.id,
        queue = %shared.queue,
        concurrency = shared.settings.concurrency,
        "worker started"
    );

    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        let permit = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender が消えたら止める
                if changed.is_err() {
                    break;
                }
                continue;
            }
            permit = Arc::clone(&shared.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let claimed = shared
            .lifecycle
            .claim_next(&shared.queue, shared.id, shared.settings.lease_duration)
            .await;

        match claimed {
            Ok(Some(job)) => start_attempt(&shared, job, permit),
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = shared.lifecycle.store().wait_for_work(&shared.queue, shared.settings.poll_interval) => {}
                }
            }
            Err(err) => {
                drop(permit);
                if err.is_transient() {
                    tracing::warn!(worker = %shared.id, error = %err, "store unavailable, backing off");
                } else {
                    tracing::error!(worker = %shared.id, error = %err, "claim failed, backing off");
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(shared.settings.poll_interval) => {}
                }
            }
        }
    }

    tracing::info!(worker = %shared.id, queue = %shared.queue, "worker stopped claiming");
}

fn start_attempt(shared: &Arc<Shared>, job: JobRecord, permit: OwnedSemaphorePermit) {
    let Some(lease_id) = job.lease_id() else {
        tracing::error!(job_id = %job.id, "claimed job carries no lease");
        return;
    };

    let processor = Arc::clone(&shared.processor);
    let context = JobContext::from(&job);
    let processing = tokio::spawn(async move { processor.process(context).await });
    let abort = processing.abort_handle();
    let job_id = job.id;

    // attempt task が自分の entry を消すのは insert の後
    let mut in_flight = shared.in_flight();
    let handle = tokio::spawn({
        let shared = Arc::clone(shared);
        async move {
            let _permit = permit;
            attempt(&shared, job, lease_id, processing).await;
            shared.in_flight().remove(&job_id);
        }
    });
    in_flight.insert(
        job_id,
        InFlight {
            lease_id,
            abort,
            attempt: handle,
        },
    );
}

async fn attempt(
    shared: &Shared,
    job: JobRecord,
    lease_id: LeaseId,
    mut processing: JoinHandle<Result<serde_json::Value, ProcessError>>,
) {
    let lease_for = shared.settings.lease_duration;
    let every = (lease_for / 2).max(Duration::from_millis(1));
    let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

    let joined = loop {
        tokio::select! {
            joined = &mut processing => break joined,
            _ = renew.tick() => {
                if let Err(err) = shared.lifecycle.store().extend_lease(job.id, lease_id, lease_for).await {
                    tracing::warn!(worker = %shared.id, job_id = %job.id, error = %err, "lease renewal failed");
                }
            }
        }
    };

    let result = match joined {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => {
            tracing::debug!(worker = %shared.id, job_id = %job.id, "attempt aborted");
            return;
        }
        Err(err) => Err(ProcessError::from_panic(err.into_panic())),
    };

    let reported = match result {
        Ok(value) => shared.lifecycle.report_success(&job, value).await,
        Err(err) => {
            tracing::debug!(worker = %shared.id, job_id = %job.id, error = %err, "attempt failed");
            shared
                .lifecycle
                .report_failure(&job, FailureOutcome::from(err))
                .await
        }
    };

    match reported {
        Ok(_) => {}
        Err(err @ QueueError::LeaseLost { .. }) => {
            tracing::warn!(worker = %shared.id, job_id = %job.id, error = %err, "lease lost, result dropped");
        }
        // already logged by the lifecycle
        Err(QueueError::InvalidTransition { .. }) => {}
        Err(err) => {
            tracing::warn!(worker = %shared.id, job_id = %job.id, error = %err, "could not report attempt");
        }
    }
}
