//! RuntimeBuilder - ランタイムの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 循環参照の切り方（Weak / 後から set する handler）

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::{SpaceId, TransactionRef};
use crate::impls::ResponseCollector;
use crate::ports::{
    Clock, IdGenerator, LockedTaskHandler, MonotonicClock, NoDeadlockDetection, OperationExecutor,
    ResponseSink, UlidGenerator,
};
use crate::task::{Task, TaskContext};
use crate::timeout::TimeoutProcessorError;
use crate::txn::TransactionRegistry;
use crate::wait::{TransactionLookup, WaitAndEventStore};

use super::config::RuntimeConfig;
use super::dispatcher::Dispatcher;
use super::queue::{InternalSubmitter, RunQueue};
use super::reschedule::{RequestTimeoutHandler, TaskRescheduler};
use super::runtime::SpaceRuntime;

/// RuntimeBuilder は SpaceRuntime を構築
///
/// # 使用例
/// ```ignore
/// let runtime = RuntimeBuilder::new(Arc::new(InMemorySpace::new()))
///     .config(RuntimeConfig { workers: 8, ..Default::default() })
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - workers が 0 なら BuildError::NoWorkers
/// - tokio runtime の外で呼ばれたら BuildError::NoRuntime
/// - timeout processor が起動できなければそのエラーを返す
pub struct RuntimeBuilder {
    executor: Arc<dyn OperationExecutor>,
    config: RuntimeConfig,
    clock: Option<Arc<dyn Clock>>,
    locked_tasks: Arc<dyn LockedTaskHandler>,
    fallback: Option<Arc<dyn ResponseSink>>,
    space: Option<SpaceId>,
}

/// BuildError はランタイム構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("at least one worker is required")]
    NoWorkers,

    #[error("the space runtime must be built inside a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    TimeoutProcessor(#[from] TimeoutProcessorError),
}

impl RuntimeBuilder {
    pub fn new(executor: Arc<dyn OperationExecutor>) -> Self {
        Self {
            executor,
            config: RuntimeConfig::default(),
            clock: None,
            locked_tasks: Arc::new(NoDeadlockDetection),
            fallback: None,
            space: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// 時刻を差し替える（テスト用）
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// デッドロック検出のフック
    pub fn locked_task_handler(mut self, handler: Arc<dyn LockedTaskHandler>) -> Self {
        self.locked_tasks = handler;
        self
    }

    /// Receives answers nobody awaits, e.g. those of requests the runtime
    /// issued itself.
    pub fn unclaimed_answers(mut self, sink: Arc<dyn ResponseSink>) -> Self {
        self.fallback = Some(sink);
        self
    }

    pub fn space_id(mut self, space: SpaceId) -> Self {
        self.space = Some(space);
        self
    }

    /// RuntimeBuilder を構築して SpaceRuntime を生成
    ///
    /// # Wiring
    /// 1. run queue と 2 つの timeout processor
    /// 2. wait store（rescheduler は queue と request TP を持つ）
    /// 3. request TP に timeout handler を後から設定
    /// 4. registry を作り、wait store へは Weak で結ぶ
    /// 5. worker を起動
    pub fn build(self) -> Result<SpaceRuntime, BuildError> {
        let config = self.config;
        if config.workers == 0 {
            return Err(BuildError::NoWorkers);
        }
        tokio::runtime::Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(MonotonicClock::new()),
        };
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let space = self.space.unwrap_or_else(|| SpaceId::from_ulid(Ulid::new()));
        let locked_tasks = self.locked_tasks;

        let queue = RunQueue::new();
        let request_timeouts = config.request_timeouts.start::<Task>("Request-TP")?;
        let transaction_timeouts = config
            .transaction_timeouts
            .start::<TransactionRef>("Transaction-TP")?;

        let rescheduler = Arc::new(TaskRescheduler::new(
            queue.clone(),
            Arc::clone(&request_timeouts),
            Arc::clone(&locked_tasks),
        ));
        let wait_store: Arc<WaitAndEventStore<Task>> =
            Arc::new(WaitAndEventStore::new(rescheduler));
        request_timeouts.set_timeout_handler(Arc::new(RequestTimeoutHandler::new(
            queue.clone(),
            Arc::clone(&wait_store),
            Arc::clone(&locked_tasks),
        )));

        let registry = Arc::new(TransactionRegistry::new(
            space,
            transaction_timeouts,
            Arc::clone(&wait_store),
            Arc::clone(&clock),
            Arc::new(InternalSubmitter::new(queue.clone(), Arc::clone(&ids))),
            config.timed_out_history,
        ));
        let lookup: Arc<dyn TransactionLookup> = registry.clone();
        wait_store.bind_transactions(Arc::downgrade(&lookup));

        let collector = Arc::new(ResponseCollector::new(self.fallback));
        let ctx = Arc::new(TaskContext {
            executor: self.executor,
            registry,
            wait_store,
            request_timeouts,
            responses: collector.clone(),
            locked_tasks,
            clock,
            ids,
        });
        let dispatcher = Dispatcher::start(config.workers, queue, Arc::clone(&ctx));

        tracing::info!(space = %space, workers = config.workers, "space runtime started");
        Ok(SpaceRuntime::new(config, dispatcher, ctx, collector))
    }
}
