//! WaitInfo - (container, category) ごとの待機情報

use std::collections::HashMap;

use crate::domain::{RequestRef, TransactionRef};
use crate::ports::Timestamp;

use super::ParkedTask;

pub(crate) struct WaitInfo<T> {
    /// Most recent committed change. Never decreases.
    last_committed: Option<Timestamp>,
    /// Most recent uncommitted event per open transaction.
    uncommitted: HashMap<TransactionRef, Timestamp>,
    waiting: Vec<ParkedTask<T>>,
}

impl<T> WaitInfo<T> {
    pub(crate) fn new() -> Self {
        Self {
            last_committed: None,
            uncommitted: HashMap::new(),
            waiting: Vec::new(),
        }
    }

    pub(crate) fn last_committed(&self) -> Option<Timestamp> {
        self.last_committed
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }

    pub(crate) fn uncommitted_len(&self) -> usize {
        self.uncommitted.len()
    }

    /// Latest event the transaction could have missed: its own uncommitted
    /// event or the last commit, whichever is later.
    pub(crate) fn latest_event_for(&self, tx: &TransactionRef) -> Option<Timestamp> {
        let own = self.uncommitted.get(tx).copied();
        match (own, self.last_committed) {
            (Some(own), Some(committed)) => Some(own.max(committed)),
            (own, committed) => own.or(committed),
        }
    }

    pub(crate) fn admit(&mut self, task: ParkedTask<T>, event_time: Timestamp) {
        self.uncommitted.insert(task.tx, event_time);
        self.waiting.push(task);
    }

    /// Advances the transaction's uncommitted timestamp to at least `event_time`.
    pub(crate) fn record_event(&mut self, tx: TransactionRef, event_time: Timestamp) {
        let slot = self.uncommitted.entry(tx).or_insert(event_time);
        if *slot < event_time {
            *slot = event_time;
        }
    }

    /// Takes same-transaction tasks whose last attempt was at or before
    /// `event_time`, leaving `exclude` in place.
    pub(crate) fn take_same_transaction(
        &mut self,
        tx: &TransactionRef,
        exclude: Option<RequestRef>,
        event_time: Option<Timestamp>,
    ) -> Vec<ParkedTask<T>> {
        self.take_where(|task| {
            task.tx == *tx
                && Some(task.request) != exclude
                && event_time.is_none_or(|at| task.last_execution <= at)
        })
    }

    pub(crate) fn take_all(&mut self) -> Vec<ParkedTask<T>> {
        std::mem::take(&mut self.waiting)
    }

    pub(crate) fn remove(&mut self, request: RequestRef) -> Option<ParkedTask<T>> {
        let index = self.waiting.iter().position(|task| task.request == request)?;
        Some(self.waiting.remove(index))
    }

    /// Applies the end of a transaction and returns the tasks to reschedule.
    pub(crate) fn finish_transaction(
        &mut self,
        tx: &TransactionRef,
        event_time: Timestamp,
        commit: bool,
        reschedule_all: bool,
    ) -> Vec<ParkedTask<T>> {
        let mut finished_at = event_time;
        let mut woken = Vec::new();
        if let Some(uncommitted) = self.uncommitted.remove(tx) {
            finished_at = finished_at.max(uncommitted);
            if !reschedule_all {
                woken = self.take_same_transaction(tx, None, None);
            }
        }
        if reschedule_all {
            woken = self.take_all();
        }
        if commit && self.last_committed.is_none_or(|at| finished_at > at) {
            self.last_committed = Some(finished_at);
        }
        woken
    }

    fn take_where(&mut self, mut pick: impl FnMut(&ParkedTask<T>) -> bool) -> Vec<ParkedTask<T>> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.waiting.len());
        for task in self.waiting.drain(..) {
            if pick(&task) {
                taken.push(task);
            } else {
                kept.push(task);
            }
        }
        self.waiting = kept;
        taken
    }
}
