//! Per-request logic: what an attempt runs and how its status is read.

use std::sync::Arc;

use crate::domain::{
    Answer, EventCategory, OperationCause, OperationResult, Request, RequestTimeout, SpaceError,
    TransactionRef, TransactionTimeout,
};
use crate::ports::SubTransaction;

use super::{ContainerChange, Task, TaskState, TxBinding};

pub(super) enum Attempt {
    Done(Result<Answer, SpaceError>),
    /// LOCKED or DELAYABLE, and the timeout allows waiting.
    Blocked,
}

/// Category a blocked request parks under when no lock is involved.
pub(super) fn wait_category(request: &Request) -> EventCategory {
    match request {
        // a full container frees up on remove
        Request::Write { .. } => EventCategory::Remove,
        Request::Read { .. }
        | Request::Test { .. }
        | Request::Take { .. }
        | Request::Delete { .. }
        | Request::LookupContainer { .. } => EventCategory::Insert,
        _ => EventCategory::UnlockShortTerm,
    }
}

/// Categories a successful attempt fires, besides `UnlockShortTerm`.
pub(super) fn fired_categories(request: &Request) -> &'static [EventCategory] {
    match request {
        Request::Write { .. } => &[EventCategory::Insert, EventCategory::UnlockLongTerm],
        Request::Take { .. } | Request::Delete { .. } => &[EventCategory::Remove],
        _ => &[],
    }
}

/// Turns an executor status into an answer, a block, or an error.
///
/// | status    | Zero  | TryOnce | otherwise |
/// |-----------|-------|---------|-----------|
/// | LOCKED    | error | block   | block     |
/// | DELAYABLE | error | error   | block     |
/// | NOTOK     | error | error   | error     |
pub(super) fn interpret(
    state: &mut TaskState,
    result: OperationResult<Answer>,
    timeout: RequestTimeout,
) -> Result<Option<Answer>, SpaceError> {
    state.executed = true;
    match result {
        OperationResult::Ok(answer) => Ok(Some(answer)),
        OperationResult::NotOk(cause) => Err(SpaceError::Operation(cause)),
        OperationResult::Locked(cause) => match timeout {
            RequestTimeout::Zero => Err(SpaceError::Locked(cause)),
            _ => {
                state.lock_cause = Some(cause);
                Ok(None)
            }
        },
        OperationResult::Delayable(cause) => match timeout {
            RequestTimeout::Zero | RequestTimeout::TryOnce => Err(SpaceError::Operation(cause)),
            _ => Ok(None),
        },
    }
}

/// A lookup of a container that does not exist yet waits for it to appear.
pub(super) fn lookup_waits_for_creation(
    result: OperationResult<Answer>,
    timeout: RequestTimeout,
) -> OperationResult<Answer> {
    match result {
        OperationResult::NotOk(cause @ OperationCause::ContainerNotFound { .. })
            if !matches!(timeout, RequestTimeout::Zero | RequestTimeout::TryOnce) =>
        {
            OperationResult::Delayable(cause)
        }
        other => other,
    }
}

impl Task {
    pub(super) async fn attempt(&self, state: &mut TaskState) -> Attempt {
        let ctx = self.ctx();
        match self.request() {
            Request::CreateTransaction { timeout } => {
                let reference = self.open_transaction(*timeout, false).reference;
                Attempt::Done(Ok(Answer::Transaction(reference)))
            }
            Request::CommitTransaction { transaction } => Attempt::Done(
                ctx.registry
                    .commit_transaction(transaction)
                    .await
                    .map(|()| Answer::Done),
            ),
            Request::RollbackTransaction { transaction } => Attempt::Done(
                ctx.registry
                    .rollback_transaction(transaction)
                    .await
                    .map(|()| Answer::Done),
            ),
            _ => self.attempt_in_transaction(state).await,
        }
    }

    fn open_transaction(&self, timeout: TransactionTimeout, implicit: bool) -> TxBinding {
        let ctx = self.ctx();
        let tx = ctx.executor.new_transaction();
        let reference = TransactionRef::new(ctx.registry.space(), ctx.ids.generate_tx_id());
        ctx.registry
            .add_transaction(reference, Arc::clone(&tx), timeout, implicit);
        TxBinding {
            reference,
            tx,
            implicit,
        }
    }

    /// The transaction this attempt runs in, created on the first attempt of
    /// a request without one.
    fn bind_transaction(&self, state: &mut TaskState) -> Result<TxBinding, SpaceError> {
        let registry = &self.ctx().registry;
        if let Some(binding) = &state.tx {
            // a timeout or shutdown may have finished it since the last attempt
            return match registry.get_transaction(&binding.reference) {
                Ok(_) => Ok(binding.clone()),
                Err(err) => {
                    state.tx = None;
                    Err(err)
                }
            };
        }
        let binding = match self.request().transaction() {
            Some(reference) => TxBinding {
                reference,
                tx: registry.get_transaction(&reference)?,
                implicit: false,
            },
            None => self.open_transaction(TransactionTimeout::Infinite, true),
        };
        state.tx = Some(binding.clone());
        Ok(binding)
    }

    async fn attempt_in_transaction(&self, state: &mut TaskState) -> Attempt {
        let binding = match self.bind_transaction(state) {
            Ok(binding) => binding,
            Err(err) => return Attempt::Done(Err(err)),
        };
        let stx = match binding.tx.new_sub_transaction() {
            Ok(stx) => stx,
            Err(err) => {
                self.rollback_implicit(state).await;
                return Attempt::Done(Err(err));
            }
        };

        match self.execute(state, stx.as_ref()).await {
            Ok(Some(answer)) => {
                if let Err(err) = stx.commit() {
                    tracing::error!(
                        request = %self.request_ref(),
                        stx = %stx.label(),
                        error = %err,
                        "committing sub-transaction failed"
                    );
                    self.rollback_implicit(state).await;
                    return Attempt::Done(Err(err));
                }
                if binding.implicit {
                    state.tx = None;
                    if let Err(err) = self
                        .ctx()
                        .registry
                        .commit_transaction(&binding.reference)
                        .await
                    {
                        return Attempt::Done(Err(err));
                    }
                }
                Attempt::Done(Ok(answer))
            }
            Ok(None) => {
                self.rollback_sub_transaction(stx.as_ref());
                Attempt::Blocked
            }
            Err(err) => {
                self.rollback_sub_transaction(stx.as_ref());
                self.rollback_implicit(state).await;
                Attempt::Done(Err(err))
            }
        }
    }

    fn rollback_sub_transaction(&self, stx: &dyn SubTransaction) {
        if let Err(err) = stx.rollback() {
            tracing::warn!(
                request = %self.request_ref(),
                stx = %stx.label(),
                error = %err,
                "rolling back sub-transaction failed"
            );
        }
    }

    /// Runs the executor operation. `Ok(None)` means the attempt blocked.
    async fn execute(
        &self,
        state: &mut TaskState,
        stx: &dyn SubTransaction,
    ) -> Result<Option<Answer>, SpaceError> {
        let executor = &self.ctx().executor;
        let request = self.request();
        let timeout = request.timeout();

        let result = match request {
            Request::Write {
                container, entries, ..
            } => executor
                .write(*container, entries, stx)
                .await
                .map(|()| Answer::Done),
            Request::Read {
                container,
                selector,
                isolation,
                ..
            } => executor
                .read(*container, selector, *isolation, stx)
                .await
                .map(Answer::Entries),
            Request::Take {
                container,
                selector,
                ..
            } => executor
                .take(*container, selector, stx)
                .await
                .map(Answer::Entries),
            Request::Test {
                container,
                selector,
                isolation,
                ..
            } => executor
                .test(*container, selector, *isolation, stx)
                .await
                .map(Answer::Count),
            Request::Delete {
                container,
                selector,
                ..
            } => executor
                .delete(*container, selector, stx)
                .await
                .map(Answer::Count),
            Request::CreateContainer { spec, .. } => {
                let result = executor.create_container(spec, stx).await;
                if let OperationResult::Ok(created) = &result {
                    state.container_change = Some(ContainerChange::Created(*created));
                }
                result.map(Answer::Container)
            }
            Request::DestroyContainer { container, .. } => {
                let result = executor.destroy_container(*container, stx).await;
                if let OperationResult::Ok(()) = &result {
                    state.container_change = Some(ContainerChange::Destroyed(*container));
                }
                result.map(|()| Answer::Done)
            }
            Request::LookupContainer { name, .. } => lookup_waits_for_creation(
                executor
                    .lookup_container(name, stx)
                    .await
                    .map(Answer::Container),
                timeout,
            ),
            Request::LockContainer { container, .. } => executor
                .lock_container(*container, stx)
                .await
                .map(|()| Answer::Done),
            Request::CreateTransaction { .. }
            | Request::CommitTransaction { .. }
            | Request::RollbackTransaction { .. } => {
                return Err(SpaceError::Internal(format!(
                    "{} does not run in a sub-transaction",
                    request.name()
                )));
            }
        };

        tracing::trace!(
            request = %self.request_ref(),
            status = ?result.status(),
            "operation executed"
        );
        interpret(state, result, timeout)
    }
}
