//! TransactionRegistry - トランザクション参照の管理
//!
//! Maps client-visible references to executor transactions. Explicit
//! transactions with a finite timeout are tracked by a timeout processor;
//! when one fires, a rollback request is submitted through the normal request
//! path so its wakeups happen exactly like a client rollback.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::domain::{Request, SpaceError, SpaceId, TransactionRef, TransactionTimeout};
use crate::ports::{Clock, Transaction};
use crate::timeout::{ExpiringElement, TimeoutHandler, TimeoutProcessor};
use crate::wait::{TransactionLookup, WaitAndEventStore};

use super::deferred::{DeferredAction, Resolution, apply_all};

/// Accepts requests the runtime issues on its own behalf.
pub trait InternalRequests: Send + Sync {
    fn submit_internal(&self, request: Request) -> Result<(), SpaceError>;
}

struct RegistryEntry {
    tx: Arc<dyn Transaction>,
    implicit: bool,
    /// Registered with the timeout processor.
    timed: bool,
    deferred: Vec<DeferredAction>,
    created_at: DateTime<Utc>,
}

/// Bounded FIFO of timed-out references. Best effort only.
struct TimedOutHistory {
    order: VecDeque<TransactionRef>,
    members: HashSet<TransactionRef>,
    capacity: usize,
}

impl TimedOutHistory {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn remember(&mut self, tx: TransactionRef) {
        if self.capacity == 0 || !self.members.insert(tx) {
            return;
        }
        self.order.push_back(tx);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, tx: &TransactionRef) -> bool {
        self.members.contains(tx)
    }
}

struct RegistryState {
    live: HashMap<TransactionRef, RegistryEntry>,
    timed_out: TimedOutHistory,
    shut_down: bool,
}

fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of one open transaction for status views.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TransactionInfo {
    pub reference: TransactionRef,
    pub implicit: bool,
    pub has_timeout: bool,
    pub created_at: DateTime<Utc>,
}

pub struct TransactionRegistry<T> {
    space: SpaceId,
    state: Arc<Mutex<RegistryState>>,
    timeouts: Arc<dyn TimeoutProcessor<TransactionRef>>,
    wait_store: Arc<WaitAndEventStore<T>>,
    clock: Arc<dyn Clock>,
}

impl<T: Send + 'static> TransactionRegistry<T> {
    /// Creates the registry and installs its timeout handler on `timeouts`.
    pub fn new(
        space: SpaceId,
        timeouts: Arc<dyn TimeoutProcessor<TransactionRef>>,
        wait_store: Arc<WaitAndEventStore<T>>,
        clock: Arc<dyn Clock>,
        requests: Arc<dyn InternalRequests>,
        timed_out_history: usize,
    ) -> Self {
        let state = Arc::new(Mutex::new(RegistryState {
            live: HashMap::new(),
            timed_out: TimedOutHistory::new(timed_out_history),
            shut_down: false,
        }));
        timeouts.set_timeout_handler(Arc::new(TransactionTimeoutHandler {
            state: Arc::clone(&state),
            requests,
        }));
        Self {
            space,
            state,
            timeouts,
            wait_store,
            clock,
        }
    }
}

impl<T> TransactionRegistry<T> {
    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn add_transaction(
        &self,
        reference: TransactionRef,
        tx: Arc<dyn Transaction>,
        timeout: TransactionTimeout,
        implicit: bool,
    ) {
        let deadline = timeout.duration();
        {
            let mut state = lock(&self.state);
            let entry = RegistryEntry {
                tx,
                implicit,
                timed: deadline.is_some(),
                deferred: Vec::new(),
                created_at: self.clock.wall_now(),
            };
            if state.live.insert(reference, entry).is_some() {
                tracing::warn!(tx = %reference, "transaction reference registered twice");
            }
        }
        if let Some(after) = deadline {
            self.timeouts
                .add_element(ExpiringElement::after(reference, after));
        }
        tracing::debug!(tx = %reference, implicit, ?timeout, "transaction registered");
    }

    /// Returns the live transaction, or says why there is none.
    pub fn get_transaction(
        &self,
        reference: &TransactionRef,
    ) -> Result<Arc<dyn Transaction>, SpaceError> {
        let state = lock(&self.state);
        match state.live.get(reference) {
            Some(entry) => Ok(Arc::clone(&entry.tx)),
            None => Err(self.missing(&state, reference)),
        }
    }

    fn missing(&self, state: &RegistryState, reference: &TransactionRef) -> SpaceError {
        if state.shut_down {
            SpaceError::ShuttingDown
        } else if state.timed_out.contains(reference) {
            SpaceError::TransactionTimedOut(*reference)
        } else if reference.space != self.space {
            SpaceError::ForeignTransaction(*reference)
        } else {
            SpaceError::UnknownTransaction(*reference)
        }
    }

    /// Attaches an action to run when the transaction ends.
    pub fn defer(&self, reference: &TransactionRef, action: DeferredAction) -> bool {
        let mut state = lock(&self.state);
        match state.live.get_mut(reference) {
            Some(entry) => {
                entry.deferred.push(action);
                true
            }
            None => {
                tracing::warn!(tx = %reference, ?action, "transaction finished before action could be deferred");
                false
            }
        }
    }

    pub async fn commit_transaction(&self, reference: &TransactionRef) -> Result<(), SpaceError> {
        let entry = self.take_entry(reference)?;
        self.finish(*reference, entry, Resolution::Commit).await
    }

    pub async fn rollback_transaction(
        &self,
        reference: &TransactionRef,
    ) -> Result<(), SpaceError> {
        let entry = self.take_entry(reference)?;
        self.finish(*reference, entry, Resolution::Rollback).await
    }

    fn take_entry(&self, reference: &TransactionRef) -> Result<RegistryEntry, SpaceError> {
        let mut state = lock(&self.state);
        match state.live.remove(reference) {
            Some(entry) => Ok(entry),
            None => Err(self.missing(&state, reference)),
        }
    }

    async fn finish(
        &self,
        reference: TransactionRef,
        entry: RegistryEntry,
        resolution: Resolution,
    ) -> Result<(), SpaceError> {
        if entry.timed && !self.timeouts.remove_element(&reference) {
            tracing::info!(tx = %reference, "transaction timeout already fired");
        }

        entry.tx.lock_and_wait_for_sub_transactions().await;
        let accessed = entry.tx.accessed_containers();
        let result = match resolution {
            Resolution::Commit => entry.tx.commit(),
            Resolution::Rollback => entry.tx.rollback(),
        };

        // the wakeups below happen whatever the outcome
        let applied = match &result {
            Ok(()) => resolution,
            Err(err) => {
                tracing::error!(tx = %reference, ?resolution, error = %err, "finishing transaction failed");
                Resolution::Rollback
            }
        };
        apply_all(entry.deferred, applied, &self.wait_store);

        let event_time = self.clock.now();
        match resolution {
            Resolution::Commit => {
                self.wait_store
                    .process_transaction_commit(&reference, &accessed, event_time)
            }
            Resolution::Rollback => {
                self.wait_store
                    .process_transaction_rollback(&reference, &accessed, event_time)
            }
        }
        tracing::debug!(
            tx = %reference,
            ?resolution,
            implicit = entry.implicit,
            containers = accessed.len(),
            "transaction finished"
        );
        result
    }

    /// Open explicit transactions (implicit ones are not counted).
    pub fn open_transactions(&self) -> usize {
        lock(&self.state)
            .live
            .values()
            .filter(|entry| !entry.implicit)
            .count()
    }

    pub fn pending_timeouts(&self) -> usize {
        self.timeouts.pending()
    }

    pub fn transactions(&self) -> Vec<TransactionInfo> {
        let state = lock(&self.state);
        let mut infos: Vec<_> = state
            .live
            .iter()
            .map(|(reference, entry)| TransactionInfo {
                reference: *reference,
                implicit: entry.implicit,
                has_timeout: entry.timed,
                created_at: entry.created_at,
            })
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Stops transaction timeouts and rolls back everything still open.
    /// Afterwards every unknown reference answers `ShuttingDown`.
    pub async fn shutdown(&self) {
        self.timeouts.shutdown();
        let open: Vec<_> = {
            let mut state = lock(&self.state);
            state.shut_down = true;
            state.live.drain().collect()
        };
        if !open.is_empty() {
            tracing::info!(count = open.len(), "rolling back open transactions");
        }
        for (reference, entry) in open {
            // errors are logged by finish
            let _ = self.finish(reference, entry, Resolution::Rollback).await;
        }
    }
}

impl<T: Send> TransactionLookup for TransactionRegistry<T> {
    fn is_live(&self, tx: &TransactionRef) -> bool {
        lock(&self.state).live.contains_key(tx)
    }
}

struct TransactionTimeoutHandler {
    state: Arc<Mutex<RegistryState>>,
    requests: Arc<dyn InternalRequests>,
}

impl TimeoutHandler<TransactionRef> for TransactionTimeoutHandler {
    fn element_timed_out(&self, reference: TransactionRef) {
        {
            let mut state = lock(&self.state);
            if !state.live.contains_key(&reference) {
                tracing::info!(tx = %reference, "timed-out transaction already finished (concurrent commit or rollback)");
                return;
            }
            state.timed_out.remember(reference);
        }
        tracing::info!(tx = %reference, "transaction timed out, rolling back");
        if let Err(err) = self.requests.submit_internal(Request::RollbackTransaction {
            transaction: reference,
        }) {
            tracing::error!(tx = %reference, error = %err, "could not submit rollback for timed-out transaction");
        }
    }
}
