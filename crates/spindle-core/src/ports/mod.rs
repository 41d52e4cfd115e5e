//! Ports - 抽象化レイヤー
//!
//! 外部の collaborator（永続化 store、ユーザーの処理関数、時刻、ID 生成）への
//! インターフェースです。実装は `impls` にあります。

pub mod clock;
pub mod id_generator;
pub mod processor;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::processor::{JobContext, Processor};
pub use self::store::{JobStore, StalledJob};
