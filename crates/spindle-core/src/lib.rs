//! spindle-core
//!
//! Request execution and blocking coordination for a tuple space.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, request, answer, status, category, errors）
//! - **ports**: 抽象化レイヤー（OperationExecutor, Clock, IdGenerator, ResponseSink など）
//! - **timeout**: ExpiringElement と blocking / polling の timeout processor
//! - **wait**: WaitAndEventStore（待機タスクの駐車と起床）
//! - **txn**: TransactionRegistry（明示・暗黙トランザクションの管理）
//! - **task**: Task（1 リクエストの実行と再試行）
//! - **app**: ランタイム（builder, dispatcher, run queue, stats）
//! - **impls**: 実装（InMemorySpace, ResponseCollector）

pub mod domain;
pub mod ports;
pub mod timeout;
pub mod wait;
pub mod txn;
pub mod task;
pub mod app;
pub mod impls;

pub use app::{BuildError, RuntimeBuilder, RuntimeConfig, RuntimeStats, SpaceRuntime};
pub use domain::{
    Answer, ContainerRef, ContainerSpec, Count, Entry, EventCategory, IsolationLevel, Request,
    RequestRef, RequestTimeout, Selector, SpaceError, TransactionRef, TransactionTimeout,
};
pub use impls::{InMemorySpace, PendingAnswer};
pub use task::{Task, TaskPhase};
