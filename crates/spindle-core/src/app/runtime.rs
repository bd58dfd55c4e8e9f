//! SpaceRuntime - リクエスト実行の表面
//!
//! # 使用例
//! ```ignore
//! let runtime = SpaceRuntime::builder(Arc::new(InMemorySpace::new())).build()?;
//! let container = runtime
//!     .call(Request::CreateContainer { spec: ContainerSpec::named("jobs"), transaction: None })
//!     .await?
//!     .container();
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::{Answer, Request, RequestMessage, SpaceError, SpaceId};
use crate::impls::{PendingAnswer, ResponseCollector};
use crate::ports::OperationExecutor;
use crate::task::TaskContext;
use crate::txn::TransactionInfo;

use super::builder::RuntimeBuilder;
use super::config::RuntimeConfig;
use super::dispatcher::Dispatcher;
use super::queue::Job;
use super::status::RuntimeStats;

pub struct SpaceRuntime {
    config: RuntimeConfig,
    dispatcher: Dispatcher,
    ctx: Arc<TaskContext>,
    collector: Arc<ResponseCollector>,
    shut_down: AtomicBool,
}

impl SpaceRuntime {
    pub fn builder(executor: Arc<dyn OperationExecutor>) -> RuntimeBuilder {
        RuntimeBuilder::new(executor)
    }

    pub(super) fn new(
        config: RuntimeConfig,
        dispatcher: Dispatcher,
        ctx: Arc<TaskContext>,
        collector: Arc<ResponseCollector>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            ctx,
            collector,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn space(&self) -> SpaceId {
        self.ctx.registry.space()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Queues a request; the answer arrives through the returned handle.
    pub fn submit(&self, request: Request) -> Result<PendingAnswer, SpaceError> {
        let request_ref = self.ctx.ids.generate_request_ref();
        // register first: a fast answer must find its caller
        let pending = self.collector.register(request_ref);
        if let Err(err) = self
            .dispatcher
            .process_request(RequestMessage::client(request_ref, request))
        {
            self.collector.forget(request_ref);
            return Err(err);
        }
        Ok(pending)
    }

    /// Submits a request and waits for its answer.
    pub async fn call(&self, request: Request) -> Result<Answer, SpaceError> {
        self.submit(request)?.wait().await
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            queued: self.dispatcher.queued(),
            parked: self.ctx.wait_store.parked_count(),
            open_transactions: self.ctx.registry.open_transactions(),
            pending_request_timeouts: self.ctx.request_timeouts.pending(),
            pending_transaction_timeouts: self.ctx.registry.pending_timeouts(),
            awaiting_answers: self.collector.awaiting(),
            uncommitted_events: self.ctx.wait_store.uncommitted_count(),
        }
    }

    /// Open transactions, oldest first.
    pub fn transactions(&self) -> Vec<TransactionInfo> {
        self.ctx.registry.transactions()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stops the runtime. Every request still in flight is answered, most of
    /// them with `ShuttingDown`.
    ///
    /// # 順序
    /// 1. 新規リクエストの受付を止める
    /// 2. 開いているトランザクションを全て rollback
    /// 3. request timeout processor を止める
    /// 4. wait store を閉じ、待機中タスクに ShuttingDown を返す
    /// 5. run queue を閉じ、ワーカーを待つ（`wait`）か中断する
    pub async fn shutdown(&self, wait: bool) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(space = %self.space(), wait, "shutting down space runtime");

        self.dispatcher.stop_accepting();
        self.ctx.registry.shutdown().await;
        self.ctx.request_timeouts.shutdown();

        let parked = self.ctx.wait_store.shutdown();
        let parked_count = parked.len();
        for task in parked {
            task.handle.fail(SpaceError::ShuttingDown).await;
        }

        let left = self
            .dispatcher
            .shutdown(wait, self.config.shutdown_grace())
            .await;
        let left_count = left.len();
        for job in left {
            match job {
                Job::Request(message) => self
                    .ctx
                    .responses
                    .deliver(message.request_ref, Err(SpaceError::ShuttingDown)),
                Job::Resume(task) => {
                    task.fail(SpaceError::ShuttingDown).await;
                }
            }
        }
        let abandoned = self.collector.abandon_all();

        tracing::info!(
            space = %self.space(),
            parked = parked_count,
            unrun = left_count,
            abandoned,
            "space runtime stopped"
        );
    }
}
