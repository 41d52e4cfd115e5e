//! Scheduler - delayed retry の昇格と stall recovery
//!
//! Worker とは独立に `stalled_interval` ごとに回ります。
//! - 期限の来た DelayedRetry を Waiting に戻す
//! - lease が切れた Active を Waiting に戻す（`Stalled`）か、上限を超えたら失敗させる（`Failed`）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{LifecycleEvent, QueueError, STALLED_REASON, StallOutcome};
use crate::ports::JobStore;

use super::notifier::EventNotifier;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub requeued: usize,
    pub failed: usize,
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    notifier: EventNotifier,
    max_stalled_count: u32,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, notifier: EventNotifier, max_stalled_count: u32) -> Self {
        Self {
            store,
            notifier,
            max_stalled_count,
        }
    }

    pub async fn tick(&self) -> Result<TickReport, QueueError> {
        let mut report = TickReport {
            promoted: self.store.promote_delayed().await?.len(),
            ..TickReport::default()
        };

        for stalled in self.store.reclaim_stalled(self.max_stalled_count).await? {
            let job = stalled.record;
            match stalled.outcome {
                StallOutcome::Requeued => {
                    report.requeued += 1;
                    tracing::warn!(job_id = %job.id, stalled_count = job.stalled_count, "job stalled, requeued");
                    self.notifier.publish(LifecycleEvent::Stalled {
                        queue: job.queue,
                        job_id: job.id,
                        stalled_count: job.stalled_count,
                    });
                }
                StallOutcome::Failed => {
                    report.failed += 1;
                    tracing::warn!(job_id = %job.id, stalled_count = job.stalled_count, "job failed, stall limit reached");
                    self.notifier.publish(LifecycleEvent::Failed {
                        queue: job.queue,
                        job_id: job.id,
                        attempts_made: job.attempts_made,
                        reason: STALLED_REASON.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Run `tick` every `interval` until the handle is closed.
    pub fn spawn(self, interval: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let every = interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match self.tick().await {
                            Ok(report) if report != TickReport::default() => {
                                tracing::debug!(?report, "scheduler tick");
                            }
                            Ok(_) => {}
                            Err(err) => tracing::warn!(error = %err, "scheduler tick failed"),
                        }
                    }
                }
            }
        });

        SchedulerHandle { shutdown_tx, join }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
