//! spindle-core
//!
//! Retry/backoff core of a job queue: job lifecycle state machine, retry
//! policy, worker loop, event notifier and the store port behind them.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, outcome, decision, events, errors）
//! - **policy**: retry policy と backoff
//! - **ports**: 抽象化レイヤー（JobStore, Processor, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, lifecycle, worker_loop, scheduler, notifier）
//! - **impls**: 実装（InMemoryJobStore, InProcess, Sandboxed）
//! - **config**: QueueConfig
//! - **observability**: QueueCounts

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod policy;
pub mod ports;

pub use app::{
    BuildError, EventFilter, EventNotifier, JobLifecycle, Listener, Queue, QueueBuilder, Scheduler,
    Worker,
};
pub use config::{ConfigError, QueueConfig};
pub use domain::{
    EventKind, FailureOutcome, JobId, JobOptions, JobRecord, JobState, LifecycleEvent,
    ListenerError, ProcessError, QueueError,
};
pub use impls::{InMemoryJobStore, InProcess, Sandboxed};
pub use observability::QueueCounts;
pub use policy::{BackoffStrategy, Decider, RetryPolicy};
pub use ports::{JobContext, JobStore, Processor};
