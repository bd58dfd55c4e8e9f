//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **ResponseCollector**: 応答を呼び出し元へ届ける ResponseSink
//! - **InMemorySpace**: 開発用の OperationExecutor
//!
//! 本番用の executor（永続化されたコンテナなど）は別クレートに配置します。

pub mod collector;
pub mod memory_space;

pub use self::collector::{PendingAnswer, ResponseCollector};
pub use self::memory_space::{InMemorySpace, InMemorySubTransaction, InMemoryTransaction};
