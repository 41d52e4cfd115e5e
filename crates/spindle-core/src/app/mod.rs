//! App - アプリケーション層
//!
//! ports を組み合わせてジョブのライフサイクルを動かします。
//!
//! # 主要コンポーネント
//! - **QueueBuilder / Queue**: 構築とワイヤリング、producer 側の API
//! - **JobLifecycle**: 状態遷移（claim → report → commit → publish）
//! - **Worker**: claim と処理のループ
//! - **Scheduler**: delayed retry の昇格と stall recovery
//! - **EventNotifier**: lifecycle events の配送

pub mod builder;
pub mod lifecycle;
pub mod notifier;
pub mod scheduler;
pub mod worker_loop;

pub use self::builder::{BuildError, Queue, QueueBuilder};
pub use self::lifecycle::JobLifecycle;
pub use self::notifier::{EventFilter, EventNotifier, Listener, SubscriptionId};
pub use self::scheduler::{Scheduler, SchedulerHandle, TickReport};
pub use self::worker_loop::{Worker, WorkerSettings};
