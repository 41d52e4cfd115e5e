//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryJobStore**: 開発用・テスト用の store
//! - **InProcess**: 処理関数を worker と同じ runtime で実行
//! - **Sandboxed**: 処理関数を専用の executor thread で実行（JSON メッセージで往復）
//!
//! 本番用の store は別クレートに置く想定です。

pub mod in_process;
pub mod memory_store;
pub mod sandboxed;

pub use self::in_process::InProcess;
pub use self::memory_store::InMemoryJobStore;
pub use self::sandboxed::Sandboxed;
