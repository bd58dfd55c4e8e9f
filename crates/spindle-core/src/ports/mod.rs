//! Ports - 抽象化レイヤー
//!
//! このモジュールは runtime の外側にある協調者へのインターフェースを定義します。
//! - executor: エントリのマッチングとロック（範囲外のエンジン）
//! - response: 応答の配送
//! - locked: デッドロック検出のフック
//! - clock / id_generator: テスト容易性のための抽象化

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod locked;
pub mod response;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, ManualClock, MonotonicClock, Timestamp};
pub use self::executor::{OperationExecutor, SubTransaction, Transaction};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::locked::{LockedTaskHandler, NoDeadlockDetection};
pub use self::response::ResponseSink;
