//! Task - リクエスト実行のラッパー
//!
//! A task executes one request, possibly many times. Each run makes one
//! attempt; an attempt that cannot complete parks the task in the wait store
//! until an event may have changed the outcome, or until its deadline passes.
//! The task delivers exactly one answer.
//!
//! # 実行順
//! 1. 期限切れなら Timeout を返して終了
//! 2. attempt（トランザクション操作か、sub-transaction 内の executor 操作）
//! 3. コンテナの作成 / 削除を wait store に反映
//! 4. ブロックされたら park（期限があれば timeout processor にも登録）
//! 5. イベントを発火して同じトランザクションの待機タスクを起こす

mod logic;
mod phase;

pub use phase::{PhaseEvent, TaskPhase};

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::domain::{
    Answer, ContainerRef, EventCategory, LockCause, Request, RequestMessage, RequestRef,
    SpaceError, TransactionRef, merge_categories,
};
use crate::ports::{
    Clock, IdGenerator, LockedTaskHandler, OperationExecutor, ResponseSink, Timestamp,
    Transaction,
};
use crate::timeout::{ExpiringElement, TimeoutProcessor};
use crate::txn::{DeferredAction, TransactionRegistry};
use crate::wait::{EventSource, ParkedTask, WaitAndEventStore};

use logic::{Attempt, fired_categories, wait_category};

/// Everything a task needs while it runs. Shared by all tasks of a runtime.
pub struct TaskContext {
    pub executor: Arc<dyn OperationExecutor>,
    pub registry: Arc<TransactionRegistry<Task>>,
    pub wait_store: Arc<WaitAndEventStore<Task>>,
    pub request_timeouts: Arc<dyn TimeoutProcessor<Task>>,
    pub responses: Arc<dyn ResponseSink>,
    pub locked_tasks: Arc<dyn LockedTaskHandler>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

/// The transaction a task runs in.
#[derive(Clone)]
struct TxBinding {
    reference: TransactionRef,
    tx: Arc<dyn Transaction>,
    /// Created by the task for a request without a transaction.
    implicit: bool,
}

#[derive(Debug, Clone, Copy)]
enum ContainerChange {
    Created(ContainerRef),
    Destroyed(ContainerRef),
}

struct TaskState {
    phase: TaskPhase,
    execution_count: u32,
    started_at: Option<Instant>,
    /// Fixed on the first run.
    expire_at: Option<Instant>,
    last_execution: Timestamp,
    tx: Option<TxBinding>,
    /// Slot the task parks on and fires events on; None is the containerless slot.
    container: Option<ContainerRef>,

    // per attempt
    executed: bool,
    succeeded: bool,
    lock_cause: Option<LockCause>,
    container_change: Option<ContainerChange>,
}

impl TaskState {
    fn new(container: Option<ContainerRef>) -> Self {
        Self {
            phase: TaskPhase::Fresh,
            execution_count: 0,
            started_at: None,
            expire_at: None,
            last_execution: Timestamp::from_nanos(0),
            tx: None,
            container,
            executed: false,
            succeeded: false,
            lock_cause: None,
            container_change: None,
        }
    }

    fn begin_attempt(&mut self, at: Timestamp) {
        self.execution_count += 1;
        self.last_execution = at;
        self.executed = false;
        self.succeeded = false;
        self.lock_cause = None;
        self.container_change = None;
    }
}

struct TaskInner {
    message: RequestMessage,
    ctx: Arc<TaskContext>,
    state: Mutex<TaskState>,
}

/// Shared handle to a task. Equality and hashing use the request reference.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new(message: RequestMessage, ctx: Arc<TaskContext>) -> Self {
        let container = message.request.container();
        Self {
            inner: Arc::new(TaskInner {
                message,
                ctx,
                state: Mutex::new(TaskState::new(container)),
            }),
        }
    }

    pub fn request_ref(&self) -> RequestRef {
        self.inner.message.request_ref
    }

    pub fn message(&self) -> &RequestMessage {
        &self.inner.message
    }

    fn request(&self) -> &Request {
        &self.inner.message.request
    }

    fn ctx(&self) -> &TaskContext {
        &self.inner.ctx
    }

    pub async fn phase(&self) -> TaskPhase {
        self.inner.state.lock().await.phase
    }

    pub async fn execution_count(&self) -> u32 {
        self.inner.state.lock().await.execution_count
    }

    /// Runs one attempt. Runs of the same task never overlap; a run after
    /// the answer was delivered does nothing.
    pub async fn run(&self) {
        let mut state = self.inner.state.lock().await;
        if state.phase.is_answered() {
            tracing::trace!(request = %self.request_ref(), "task already answered, skipping run");
            return;
        }
        if state.phase.may_be_parked() {
            // woken by its deadline or by a stale wakeup
            self.ctx().wait_store.withdraw(self.request_ref());
        }
        if self.ctx().wait_store.is_shut_down() {
            self.rollback_implicit(&mut state).await;
            self.answer(&mut state, Err(SpaceError::ShuttingDown));
            return;
        }
        self.advance(&mut state, PhaseEvent::Start);

        let now = Instant::now();
        match state.started_at {
            None => {
                state.started_at = Some(now);
                state.expire_at = self.request().timeout().duration().map(|after| now + after);
            }
            Some(_) => {
                if state.expire_at.is_some_and(|deadline| now >= deadline) {
                    self.time_out(&mut state).await;
                    return;
                }
            }
        }

        state.begin_attempt(self.ctx().clock.now());
        tracing::trace!(
            request = %self.request_ref(),
            kind = self.request().name(),
            attempt = state.execution_count,
            "running task"
        );

        let finished = match self.attempt(&mut state).await {
            Attempt::Done(answer) => {
                state.succeeded = answer.is_ok();
                self.settle_container_change(&mut state);
                self.answer(&mut state, answer);
                true
            }
            Attempt::Blocked => false,
        };

        let Some(tx) = state.tx.as_ref().map(|binding| binding.reference) else {
            if !finished {
                tracing::error!(request = %self.request_ref(), "blocked task has no transaction");
                self.answer(
                    &mut state,
                    Err(SpaceError::Internal("blocked task has no transaction".into())),
                );
            }
            return;
        };

        let event_time = self.ctx().clock.now();
        if !finished && !self.block(&mut state, tx, event_time) {
            self.rollback_implicit(&mut state).await;
            self.answer(&mut state, Err(SpaceError::ShuttingDown));
            return;
        }
        self.trigger_events(&state, tx, event_time);
    }

    /// Answers with `error` unless the task was already answered.
    ///
    /// Used when a run panicked and when the runtime shuts down.
    pub async fn fail(&self, error: SpaceError) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.phase.is_answered() {
            return false;
        }
        if state.phase.may_be_parked() {
            self.ctx().wait_store.withdraw(self.request_ref());
        }
        self.rollback_implicit(&mut state).await;
        self.answer(&mut state, Err(error));
        true
    }

    /// Like `fail`, for callers that cannot wait. Gives up if a run is in progress.
    pub fn try_fail(&self, error: SpaceError) -> bool {
        let Ok(mut state) = self.inner.state.try_lock() else {
            return false;
        };
        if state.phase.is_answered() {
            return false;
        }
        self.answer(&mut state, Err(error));
        true
    }

    fn advance(&self, state: &mut TaskState, event: PhaseEvent) {
        match state.phase.next(event) {
            Some(next) => state.phase = next,
            None => tracing::warn!(
                request = %self.request_ref(),
                phase = ?state.phase,
                ?event,
                "ignoring invalid phase transition"
            ),
        }
    }

    fn answer(&self, state: &mut TaskState, answer: Result<Answer, SpaceError>) {
        if state.phase.is_answered() {
            tracing::warn!(request = %self.request_ref(), "task answered twice, dropping answer");
            return;
        }
        self.advance(state, PhaseEvent::Answer);
        if state.expire_at.is_some() {
            self.ctx().request_timeouts.remove_element(self);
        }
        match &answer {
            Ok(_) => tracing::debug!(
                request = %self.request_ref(),
                kind = self.request().name(),
                attempts = state.execution_count,
                "request answered"
            ),
            Err(err) => tracing::debug!(
                request = %self.request_ref(),
                kind = self.request().name(),
                attempts = state.execution_count,
                error = %err,
                "request failed"
            ),
        }
        self.ctx().responses.deliver(self.request_ref(), answer);
    }

    async fn time_out(&self, state: &mut TaskState) {
        let waited_ms = state
            .started_at
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or_default();
        self.rollback_implicit(state).await;
        self.answer(
            state,
            Err(SpaceError::Timeout {
                request: self.request_ref(),
                waited_ms,
            }),
        );
    }

    /// Rolls back the transaction the task created for itself, if any.
    async fn rollback_implicit(&self, state: &mut TaskState) {
        let Some(binding) = state.tx.take_if(|binding| binding.implicit) else {
            return;
        };
        if let Err(err) = self
            .ctx()
            .registry
            .rollback_transaction(&binding.reference)
            .await
        {
            tracing::debug!(
                request = %self.request_ref(),
                tx = %binding.reference,
                error = %err,
                "implicit transaction already finished"
            );
        }
    }

    /// Mirrors a container creation or destruction in the wait store.
    fn settle_container_change(&self, state: &mut TaskState) {
        let Some(change) = state.container_change.take() else {
            return;
        };
        if !state.succeeded {
            return;
        }
        let ctx = self.ctx();
        match change {
            ContainerChange::Created(container) => {
                ctx.wait_store.add_container(container);
                if let Some(binding) = &state.tx {
                    ctx.registry.defer(
                        &binding.reference,
                        DeferredAction::ForgetContainerOnRollback(container),
                    );
                }
                state.container = None;
            }
            ContainerChange::Destroyed(container) => match &state.tx {
                None => ctx.wait_store.remove_container(container),
                Some(binding) => {
                    ctx.registry.defer(
                        &binding.reference,
                        DeferredAction::ForgetContainerOnCommit(container),
                    );
                }
            },
        }
    }

    /// Parks the task, or bounces it back to the run queue when it raced an
    /// event. False once the wait store is closed.
    fn block(&self, state: &mut TaskState, tx: TransactionRef, event_time: Timestamp) -> bool {
        let ctx = self.ctx();
        let category = state
            .lock_cause
            .as_ref()
            .map_or_else(|| wait_category(self.request()), LockCause::wait_category);

        if category == EventCategory::UnlockLongTerm {
            if let (Some(cause), Some(binding)) = (&state.lock_cause, &state.tx) {
                ctx.locked_tasks
                    .task_locked(self.request_ref(), &binding.tx.label(), cause);
            }
        }

        tracing::debug!(
            request = %self.request_ref(),
            tx = %tx,
            ?category,
            attempt = state.execution_count,
            "request blocked"
        );
        let parked = ParkedTask {
            request: self.request_ref(),
            tx,
            container: state.container,
            category,
            last_execution: state.last_execution,
            can_time_out: state.expire_at.is_some(),
            handle: self.clone(),
        };
        if !ctx.wait_store.add_task(parked, event_time) {
            if ctx.wait_store.is_shut_down() {
                return false;
            }
            self.advance(state, PhaseEvent::Bounce);
            return true;
        }
        self.advance(state, PhaseEvent::Park);
        if let Some(deadline) = state.expire_at {
            ctx.request_timeouts
                .add_element(ExpiringElement::new(self.clone(), deadline));
            self.advance(state, PhaseEvent::Arm);
        }
        true
    }

    fn trigger_events(&self, state: &TaskState, tx: TransactionRef, event_time: Timestamp) {
        if !state.executed {
            return;
        }
        let mut categories = Vec::new();
        if state.succeeded {
            merge_categories(&mut categories, fired_categories(self.request()));
        }
        // the attempt's sub-transaction is over either way
        merge_categories(&mut categories, &[EventCategory::UnlockShortTerm]);

        let source = EventSource {
            request: self.request_ref(),
            tx,
            container: state.container,
        };
        self.ctx()
            .wait_store
            .process_events(&source, &categories, event_time);
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.request_ref() == other.request_ref()
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.request_ref().hash(state);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("request", &self.request_ref())
            .field("kind", &self.request().name())
            .finish()
    }
}

#[cfg(test)]
mod tests;
