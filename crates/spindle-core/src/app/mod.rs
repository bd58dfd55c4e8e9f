//! App - アプリケーション層
//!
//! このモジュールは、wait store・registry・task を組み合わせてランタイムを構成します。
//!
//! # 主要コンポーネント
//! - **RuntimeBuilder**: ワイヤリングと起動時検証
//! - **SpaceRuntime**: submit / call / stats / shutdown の表面
//! - **Dispatcher**: run queue とワーカー群
//! - **TaskRescheduler / RequestTimeoutHandler**: 起床経路
//! - **RuntimeConfig**: JSON で読める設定

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod queue;
pub mod reschedule;
pub mod runtime;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, RuntimeBuilder};
pub use self::config::{RuntimeConfig, TimeoutProcessorConfig};
pub use self::dispatcher::Dispatcher;
pub use self::queue::{InternalSubmitter, Job, RunQueue};
pub use self::reschedule::{RequestTimeoutHandler, TaskRescheduler};
pub use self::runtime::SpaceRuntime;
pub use self::status::RuntimeStats;
