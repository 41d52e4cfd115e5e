//! QueueBuilder - queue の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - build() 時に config を検証する
//! - 不正なら BuildError を返し、Worker は 1 つも起動しない

use std::sync::Arc;

use crate::config::{ConfigError, QueueConfig};
use crate::domain::{JobId, JobOptions, JobRecord, NewJob, QueueError};
use crate::impls::InMemoryJobStore;
use crate::observability::QueueCounts;
use crate::policy::{Decider, RetryPolicy};
use crate::ports::{Clock, IdGenerator, JobStore, Processor, SystemClock, UlidGenerator};

use super::lifecycle::JobLifecycle;
use super::notifier::EventNotifier;
use super::scheduler::Scheduler;
use super::worker_loop::{Worker, WorkerSettings};

/// QueueBuilder は Queue を構築
///
/// # 使用例
/// ```ignore
/// let queue = QueueBuilder::new("emails")
///     .config(QueueConfig::from_path("spindle.json")?)
///     .build()?;
/// let worker = queue.worker(InProcess::new(send_email));
/// ```
///
/// 指定しなかった部品は既定値（InMemoryJobStore, SystemClock, RetryPolicy）になります。
pub struct QueueBuilder {
    name: String,
    config: QueueConfig,
    store: Option<Arc<dyn JobStore>>,
    clock: Option<Arc<dyn Clock>>,
    decider: Option<Arc<dyn Decider>>,
    notifier: Option<EventNotifier>,
}

/// BuildError は Queue 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("queue name must not be empty")]
    EmptyName,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl QueueBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: QueueConfig::default(),
            store: None,
            clock: None,
            decider: None,
            notifier: None,
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a store between queues (or bring a real one).
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock for the default in-memory store and for id timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the default `RetryPolicy`.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Result<Queue, BuildError> {
        if self.name.trim().is_empty() {
            return Err(BuildError::EmptyName);
        }
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new(Arc::clone(&clock))));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(RetryPolicy::new(self.config.backoff)));
        let notifier = self.notifier.unwrap_or_default();

        Ok(Queue {
            name: self.name,
            config: self.config,
            lifecycle: Arc::new(JobLifecycle::new(store, decider, notifier)),
            ids: Arc::new(UlidGenerator::new(clock)),
        })
    }
}

/// A named queue: producer side plus factories for workers and the scheduler.
#[derive(Clone)]
pub struct Queue {
    name: String,
    config: QueueConfig,
    lifecycle: Arc<JobLifecycle>,
    ids: Arc<dyn IdGenerator>,
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    /// Subscribe here for lifecycle events.
    pub fn events(&self) -> &EventNotifier {
        self.lifecycle.notifier()
    }

    /// Enqueue a job. Missing options fall back to the queue config.
    pub async fn add(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobRecord, QueueError> {
        let job = self
            .lifecycle
            .store()
            .enqueue(NewJob {
                queue: self.name.clone(),
                name: name.into(),
                payload,
                max_attempts: options.attempts.unwrap_or(self.config.default_attempts),
                backoff: options.backoff,
                remove_on_complete: options
                    .remove_on_complete
                    .or(self.config.remove_on_complete),
                remove_on_fail: options.remove_on_fail.or(self.config.remove_on_fail),
            })
            .await?;
        tracing::debug!(queue = %self.name, job_id = %job.id, max_attempts = job.max_attempts, "job added");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError> {
        self.lifecycle.store().get(job_id).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.lifecycle.store().counts(&self.name).await
    }

    /// Start a worker on this queue.
    pub fn worker<P>(&self, processor: P) -> Worker
    where
        P: Processor + 'static,
    {
        self.worker_with(Arc::new(processor))
    }

    pub fn worker_with(&self, processor: Arc<dyn Processor>) -> Worker {
        Worker::spawn(
            self.ids.generate_worker_id(),
            self.name.clone(),
            Arc::clone(&self.lifecycle),
            processor,
            WorkerSettings::from(&self.config),
        )
    }

    /// Scheduler over this queue's store. Call `spawn(config.stalled_interval())` to run it.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            Arc::clone(self.lifecycle.store()),
            self.events().clone(),
            self.config.max_stalled_count,
        )
    }
}
