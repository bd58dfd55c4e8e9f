//! WaitAndEventStore - ブロックされたタスクの待機と起床
//!
//! Tasks park under one (container, category) slot. Instead of holding a lock
//! across a whole attempt, every parked task carries the timestamp of its last
//! failed attempt and every finished operation records the timestamp of its
//! event. A task may only park if no event it could have missed is at or after
//! its attempt; otherwise it is rescheduled right away.
//!
//! All public operations are serialized by a single short-held lock.
//! Rescheduling happens after the lock is released.

mod info;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::domain::{ContainerRef, EventCategory, RequestRef, TransactionRef};
use crate::ports::Timestamp;

use info::WaitInfo;

/// A parked task together with the fields the store reads while it waits.
#[derive(Debug, Clone)]
pub struct ParkedTask<T> {
    pub request: RequestRef,
    pub tx: TransactionRef,
    /// None for requests parked on the containerless slot.
    pub container: Option<ContainerRef>,
    pub category: EventCategory,
    pub last_execution: Timestamp,
    /// Registered with the request timeout processor.
    pub can_time_out: bool,
    pub handle: T,
}

/// Where the events of a finished attempt happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSource {
    pub request: RequestRef,
    pub tx: TransactionRef,
    pub container: Option<ContainerRef>,
}

/// Resubmits woken tasks for execution.
pub trait Rescheduler<T>: Send + Sync {
    fn reschedule(&self, task: ParkedTask<T>);
}

/// Answers whether a transaction is still open.
pub trait TransactionLookup: Send + Sync {
    fn is_live(&self, tx: &TransactionRef) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SlotKey {
    Container(ContainerRef, EventCategory),
    Containerless,
}

struct StoreState<T> {
    containers: HashMap<ContainerRef, HashMap<EventCategory, WaitInfo<T>>>,
    /// Lookups and creations without a target container; one slot for all categories.
    containerless: WaitInfo<T>,
    /// request -> slot; a task is parked in at most one slot.
    parked: HashMap<RequestRef, SlotKey>,
    /// Containers whose slots hold an uncommitted timestamp of the transaction.
    stamped: HashMap<TransactionRef, HashSet<ContainerRef>>,
    shut_down: bool,
}

impl<T> StoreState<T> {
    fn slot_mut(&mut self, key: SlotKey) -> Option<&mut WaitInfo<T>> {
        match key {
            SlotKey::Container(container, category) => self
                .containers
                .get_mut(&container)
                .and_then(|categories| categories.get_mut(&category)),
            SlotKey::Containerless => Some(&mut self.containerless),
        }
    }

    fn unindex(&mut self, tasks: &[ParkedTask<T>]) {
        for task in tasks {
            self.parked.remove(&task.request);
        }
    }

    fn stamp(&mut self, tx: TransactionRef, container: ContainerRef) {
        self.stamped.entry(tx).or_default().insert(container);
    }

    fn take_parked(&mut self, request: RequestRef) -> Option<ParkedTask<T>> {
        let key = self.parked.remove(&request)?;
        self.slot_mut(key)?.remove(request)
    }
}

pub struct WaitAndEventStore<T> {
    state: Mutex<StoreState<T>>,
    rescheduler: Arc<dyn Rescheduler<T>>,
    transactions: OnceLock<Weak<dyn TransactionLookup>>,
}

impl<T> WaitAndEventStore<T> {
    pub fn new(rescheduler: Arc<dyn Rescheduler<T>>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                containers: HashMap::new(),
                containerless: WaitInfo::new(),
                parked: HashMap::new(),
                stamped: HashMap::new(),
                shut_down: false,
            }),
            rescheduler,
            transactions: OnceLock::new(),
        }
    }

    /// Connects the transaction registry used for validity checks.
    ///
    /// Until bound, every transaction counts as open.
    pub fn bind_transactions(&self, lookup: Weak<dyn TransactionLookup>) {
        if self.transactions.set(lookup).is_err() {
            tracing::warn!("wait store already bound to a transaction registry");
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transaction_is_live(&self, tx: &TransactionRef) -> bool {
        match self.transactions.get() {
            None => true,
            Some(lookup) => lookup.upgrade().is_some_and(|lookup| lookup.is_live(tx)),
        }
    }

    fn reschedule_all(&self, tasks: Vec<ParkedTask<T>>) {
        for task in tasks {
            tracing::debug!(
                request = %task.request,
                tx = %task.tx,
                category = ?task.category,
                "rescheduling task"
            );
            self.rescheduler.reschedule(task);
        }
    }

    pub fn add_container(&self, container: ContainerRef) {
        let mut state = self.lock();
        if state.containers.contains_key(&container) {
            tracing::warn!(container = %container, "wait info for container already exists");
            return;
        }
        let categories = EventCategory::ALL
            .into_iter()
            .map(|category| (category, WaitInfo::new()))
            .collect();
        state.containers.insert(container, categories);
    }

    /// Tears down the container's wait info, rescheduling every task still parked on it.
    pub fn remove_container(&self, container: ContainerRef) {
        let woken = {
            let mut state = self.lock();
            let Some(categories) = state.containers.remove(&container) else {
                tracing::debug!(container = %container, "no wait info to remove for container");
                return;
            };
            let woken: Vec<_> = categories
                .into_values()
                .flat_map(|mut info| info.take_all())
                .collect();
            state.unindex(&woken);
            woken
        };
        self.reschedule_all(woken);
    }

    /// Tries to park `task`, whose failed attempt ran at `task.last_execution`.
    ///
    /// Returns false, and reschedules the task, if the container is gone, the
    /// transaction has finished, or an event the attempt could have missed
    /// happened at or after `last_execution`.
    ///
    /// The transaction is checked under the store lock, so a commit or
    /// rollback either sees the parked task or makes the check fail.
    pub fn add_task(&self, task: ParkedTask<T>, event_time: Timestamp) -> bool {
        let rejected = {
            let mut state = self.lock();
            let key = match task.container {
                Some(container) => SlotKey::Container(container, task.category),
                None => SlotKey::Containerless,
            };
            if let Some(previous) = state.take_parked(task.request) {
                tracing::warn!(request = %previous.request, "task was still parked, replacing");
            }

            if state.shut_down {
                Some((task, "store is shut down"))
            } else if !self.transaction_is_live(&task.tx) {
                Some((task, "transaction no longer valid"))
            } else {
                match state.slot_mut(key) {
                    None => Some((task, "no wait info for container")),
                    Some(info) => match info.latest_event_for(&task.tx) {
                        Some(latest) if task.last_execution <= latest => {
                            Some((task, "event raced with the attempt"))
                        }
                        _ => {
                            let (request, tx) = (task.request, task.tx);
                            info.admit(task, event_time);
                            state.parked.insert(request, key);
                            if let SlotKey::Container(container, _) = key {
                                state.stamp(tx, container);
                            }
                            None
                        }
                    },
                }
            }
        };

        match rejected {
            None => true,
            Some((task, reason)) => {
                tracing::debug!(request = %task.request, tx = %task.tx, reason, "not parking task");
                self.rescheduler.reschedule(task);
                false
            }
        }
    }

    /// Drops a parked task, e.g. because its deadline fired.
    pub fn remove_task(&self, request: RequestRef) -> Option<ParkedTask<T>> {
        let removed = self.lock().take_parked(request);
        if removed.is_none() {
            tracing::info!(request = %request, "task to remove was not parked");
        }
        removed
    }

    /// Like `remove_task`, without treating a missing task as noteworthy.
    pub fn withdraw(&self, request: RequestRef) -> Option<ParkedTask<T>> {
        self.lock().take_parked(request)
    }

    pub fn is_parked(&self, request: RequestRef) -> bool {
        self.lock().parked.contains_key(&request)
    }

    /// Records the events of a finished attempt and wakes same-transaction
    /// tasks that attempted at or before `event_time`.
    pub fn process_events(
        &self,
        source: &EventSource,
        categories: &[EventCategory],
        event_time: Timestamp,
    ) {
        let woken = {
            let mut state = self.lock();
            let mut woken = Vec::new();
            match source.container {
                None => {
                    let info = &mut state.containerless;
                    info.record_event(source.tx, event_time);
                    woken.extend(info.take_same_transaction(
                        &source.tx,
                        Some(source.request),
                        Some(event_time),
                    ));
                }
                Some(container) => {
                    let Some(infos) = state.containers.get_mut(&container) else {
                        tracing::warn!(container = %container, "no wait info for container, skipping events");
                        return;
                    };
                    for category in categories {
                        let Some(info) = infos.get_mut(category) else {
                            continue;
                        };
                        info.record_event(source.tx, event_time);
                        woken.extend(info.take_same_transaction(
                            &source.tx,
                            Some(source.request),
                            Some(event_time),
                        ));
                    }
                    if !categories.is_empty() {
                        state.stamp(source.tx, container);
                    }
                }
            }
            state.unindex(&woken);
            woken
        };
        self.reschedule_all(woken);
    }

    /// Commit makes the changes visible to everyone: wakes every task on the
    /// accessed containers and advances their last committed time.
    pub fn process_transaction_commit(
        &self,
        tx: &TransactionRef,
        accessed: &[ContainerRef],
        event_time: Timestamp,
    ) {
        self.finish_transaction(tx, accessed, event_time, true);
    }

    /// Rollback wakes same-transaction tasks on Insert/Remove and every task
    /// on the unlock categories.
    pub fn process_transaction_rollback(
        &self,
        tx: &TransactionRef,
        accessed: &[ContainerRef],
        event_time: Timestamp,
    ) {
        self.finish_transaction(tx, accessed, event_time, false);
    }

    fn finish_transaction(
        &self,
        tx: &TransactionRef,
        accessed: &[ContainerRef],
        event_time: Timestamp,
        commit: bool,
    ) {
        let woken = {
            let mut state = self.lock();
            let mut woken = Vec::new();
            // also containers the transaction only waited on
            let stamped = state.stamped.remove(tx).unwrap_or_default();
            let visited: Vec<_> = accessed
                .iter()
                .copied()
                .chain(stamped.into_iter().filter(|c| !accessed.contains(c)))
                .collect();
            for container in &visited {
                // created or destroyed in this transaction
                let Some(infos) = state.containers.get_mut(container) else {
                    tracing::debug!(container = %container, tx = %tx, "no wait info for accessed container");
                    continue;
                };
                for (category, info) in infos.iter_mut() {
                    let reschedule_all = commit || category.rollback_wakes_all();
                    woken.extend(info.finish_transaction(tx, event_time, commit, reschedule_all));
                }
            }
            woken.extend(
                state
                    .containerless
                    .finish_transaction(tx, event_time, commit, true),
            );
            state.unindex(&woken);
            woken
        };
        self.reschedule_all(woken);
    }

    /// Last committed time of one slot, mostly for diagnostics.
    pub fn last_committed(
        &self,
        container: ContainerRef,
        category: EventCategory,
    ) -> Option<Timestamp> {
        self.lock()
            .containers
            .get(&container)
            .and_then(|categories| categories.get(&category))
            .and_then(WaitInfo::last_committed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    pub fn parked_count(&self) -> usize {
        self.lock().parked.len()
    }

    /// Uncommitted timestamps still held across all slots. Zero once every
    /// transaction that parked or raised events here has finished.
    pub fn uncommitted_count(&self) -> usize {
        let state = self.lock();
        state
            .containers
            .values()
            .flat_map(HashMap::values)
            .chain(std::iter::once(&state.containerless))
            .map(WaitInfo::uncommitted_len)
            .sum()
    }

    /// Stops admitting tasks and hands back everything still parked.
    pub fn shutdown(&self) -> Vec<ParkedTask<T>> {
        let mut state = self.lock();
        state.shut_down = true;
        state.parked.clear();
        state.stamped.clear();
        let mut drained: Vec<_> = state
            .containers
            .drain()
            .flat_map(|(_, categories)| categories.into_values())
            .flat_map(|mut info| info.take_all())
            .collect();
        drained.extend(state.containerless.take_all());
        drained
    }
}
