//! InMemorySpace - 開発用の OperationExecutor
//!
//! # 学習ポイント
//! - トランザクション分離を「誰が書いた / 誰が取った」のラベルで表現
//! - sub-transaction ごとの undo log と commit 時のマージ
//! - `as_any` による自前 sub-transaction 型の復元
//!
//! # 分離の規則
//! - 未コミットの write は書いた transaction にだけ見える
//! - 未コミットの take / delete は他の transaction には長期ロック（LOCKED）
//! - lock_container されたコンテナは他の transaction に LOCKED
//! - 未コミットで作成されたコンテナは他から見つからない
//!
//! Every operation runs atomically under one space lock, so no short-term
//! locks are ever held.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use ulid::Ulid;

use crate::domain::{
    ContainerRef, ContainerSpec, Count, Entry, IsolationLevel, LockCause, LockKind,
    OperationCause, OperationResult, Selector, SpaceError,
};
use crate::ports::{OperationExecutor, SubTransaction, Transaction};

struct StoredEntry {
    id: u64,
    value: Entry,
    /// Uncommitted writer.
    written_by: Option<String>,
    /// Uncommitted taker.
    taken_by: Option<String>,
}

/// How one entry looks to a transaction.
enum Visibility<'a> {
    Available,
    Hidden,
    LockedBy(&'a str),
}

impl StoredEntry {
    fn visibility(&self, tx: &str) -> Visibility<'_> {
        if self.written_by.as_deref().is_some_and(|writer| writer != tx) {
            return Visibility::Hidden;
        }
        match self.taken_by.as_deref() {
            None => Visibility::Available,
            Some(taker) if taker == tx => Visibility::Hidden,
            Some(taker) => Visibility::LockedBy(taker),
        }
    }
}

struct StoredContainer {
    name: Option<String>,
    capacity: Option<usize>,
    entries: Vec<StoredEntry>,
    created_by: Option<String>,
    destroyed_by: Option<String>,
    locked_by: Option<String>,
}

#[derive(Default)]
struct SpaceState {
    containers: HashMap<ContainerRef, StoredContainer>,
    names: HashMap<String, ContainerRef>,
    next_entry: u64,
}

fn lock_space(state: &Mutex<SpaceState>) -> MutexGuard<'_, SpaceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One change a (sub-)transaction made, resolved at its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Wrote(ContainerRef, u64),
    Took(ContainerRef, u64),
    Created(ContainerRef),
    Destroyed(ContainerRef),
    Locked(ContainerRef),
}

impl Change {
    fn container(self) -> ContainerRef {
        match self {
            Change::Wrote(container, _)
            | Change::Took(container, _)
            | Change::Created(container)
            | Change::Destroyed(container)
            | Change::Locked(container) => container,
        }
    }
}

impl SpaceState {
    /// Applies the outcome of `changes`: commit makes them permanent,
    /// rollback undoes them (newest first).
    fn resolve(&mut self, changes: &[Change], commit: bool) {
        if commit {
            for change in changes {
                self.resolve_one(*change, true);
            }
        } else {
            for change in changes.iter().rev() {
                self.resolve_one(*change, false);
            }
        }
    }

    fn resolve_one(&mut self, change: Change, commit: bool) {
        match change {
            Change::Wrote(container, id) => {
                let Some(stored) = self.containers.get_mut(&container) else {
                    return;
                };
                if commit {
                    if let Some(entry) = stored.entries.iter_mut().find(|entry| entry.id == id) {
                        entry.written_by = None;
                    }
                } else {
                    stored.entries.retain(|entry| entry.id != id);
                }
            }
            Change::Took(container, id) => {
                let Some(stored) = self.containers.get_mut(&container) else {
                    return;
                };
                if commit {
                    stored.entries.retain(|entry| entry.id != id);
                } else if let Some(entry) = stored.entries.iter_mut().find(|entry| entry.id == id) {
                    entry.taken_by = None;
                }
            }
            Change::Created(container) => {
                if commit {
                    if let Some(stored) = self.containers.get_mut(&container) {
                        stored.created_by = None;
                    }
                } else {
                    self.forget(container);
                }
            }
            Change::Destroyed(container) => {
                if commit {
                    self.forget(container);
                } else if let Some(stored) = self.containers.get_mut(&container) {
                    stored.destroyed_by = None;
                }
            }
            Change::Locked(container) => {
                if let Some(stored) = self.containers.get_mut(&container) {
                    stored.locked_by = None;
                }
            }
        }
    }

    fn forget(&mut self, container: ContainerRef) {
        if let Some(stored) = self.containers.remove(&container) {
            if let Some(name) = stored.name {
                self.names.remove(&name);
            }
        }
    }

    /// The container as `tx` may use it.
    fn usable(
        &mut self,
        container: ContainerRef,
        tx: &str,
    ) -> Result<&mut StoredContainer, OperationResultError> {
        let Some(stored) = self.containers.get_mut(&container) else {
            return Err(not_found(container));
        };
        if stored.created_by.as_deref().is_some_and(|creator| creator != tx)
            || stored.destroyed_by.as_deref() == Some(tx)
        {
            return Err(not_found(container));
        }
        if let Some(holder) = stored
            .destroyed_by
            .as_deref()
            .or(stored.locked_by.as_deref())
            .filter(|holder| *holder != tx)
        {
            return Err(OperationResultError::Locked(LockCause::long_term(
                LockKind::Container,
                holder,
            )));
        }
        Ok(stored)
    }
}

/// Non-OK outcome of a container lookup, convertible into any result type.
enum OperationResultError {
    NotOk(OperationCause),
    Locked(LockCause),
}

impl OperationResultError {
    fn into_result<T>(self) -> OperationResult<T> {
        match self {
            OperationResultError::NotOk(cause) => OperationResult::NotOk(cause),
            OperationResultError::Locked(cause) => OperationResult::Locked(cause),
        }
    }
}

fn not_found(container: ContainerRef) -> OperationResultError {
    OperationResultError::NotOk(OperationCause::ContainerNotFound {
        name: container.to_string(),
    })
}

/// Picks entries for `selector` in FIFO order.
fn select(
    entries: &[StoredEntry],
    selector: &Selector,
    tx: &str,
) -> OperationResult<Vec<usize>> {
    let mut picked = Vec::new();
    let mut locked_by: Option<&str> = None;
    let wanted = match selector.count {
        Count::Exactly(n) => Some(n),
        Count::All => None,
    };

    for (index, entry) in entries.iter().enumerate() {
        if wanted.is_some_and(|n| picked.len() >= n) {
            break;
        }
        if selector
            .template
            .as_ref()
            .is_some_and(|template| *template != entry.value)
        {
            continue;
        }
        match entry.visibility(tx) {
            Visibility::Available => picked.push(index),
            Visibility::Hidden => {}
            Visibility::LockedBy(holder) => {
                locked_by.get_or_insert(holder);
            }
        }
    }

    match (wanted, locked_by) {
        (Some(n), _) if picked.len() >= n => OperationResult::Ok(picked),
        (_, Some(holder)) => {
            OperationResult::Locked(LockCause::long_term(LockKind::Entry, holder))
        }
        (Some(n), None) => OperationResult::Delayable(OperationCause::NotEnoughEntries {
            needed: n,
            available: picked.len(),
        }),
        (None, None) => OperationResult::Ok(picked),
    }
}

#[derive(Default)]
struct TxState {
    valid: bool,
    /// No new sub-transactions once finishing.
    finishing: bool,
    active_subs: usize,
    next_sub: u64,
    changes: Vec<Change>,
    accessed: HashSet<ContainerRef>,
}

struct TxShared {
    label: String,
    space: Arc<Mutex<SpaceState>>,
    state: Mutex<TxState>,
    idle: Notify,
}

impl TxShared {
    fn lock(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn end_sub(&self, changes: Vec<Change>, accessed: Vec<ContainerRef>, commit: bool) {
        let mut state = self.lock();
        if commit {
            state.changes.extend(changes);
            state.accessed.extend(accessed);
        } else {
            lock_space(&self.space).resolve(&changes, false);
        }
        state.active_subs = state.active_subs.saturating_sub(1);
        if state.active_subs == 0 {
            self.idle.notify_waiters();
        }
    }
}

pub struct InMemoryTransaction {
    shared: Arc<TxShared>,
}

impl InMemoryTransaction {
    fn finish(&self, commit: bool) -> Result<(), SpaceError> {
        let mut state = self.shared.lock();
        if !state.valid {
            return Err(SpaceError::InvalidTransaction(format!(
                "{} already finished",
                self.shared.label
            )));
        }
        state.valid = false;
        let changes = std::mem::take(&mut state.changes);
        lock_space(&self.shared.space).resolve(&changes, commit);
        tracing::trace!(tx = %self.shared.label, commit, changes = changes.len(), "in-memory transaction finished");
        Ok(())
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn label(&self) -> String {
        self.shared.label.clone()
    }

    fn is_valid(&self) -> bool {
        self.shared.lock().valid
    }

    fn new_sub_transaction(&self) -> Result<Arc<dyn SubTransaction>, SpaceError> {
        let mut state = self.shared.lock();
        if !state.valid || state.finishing {
            return Err(SpaceError::InvalidTransaction(format!(
                "{} no longer accepts operations",
                self.shared.label
            )));
        }
        state.active_subs += 1;
        state.next_sub += 1;
        Ok(Arc::new(InMemorySubTransaction {
            label: format!("{}/{}", self.shared.label, state.next_sub),
            shared: Arc::clone(&self.shared),
            log: Mutex::new(SubLog::default()),
        }))
    }

    async fn lock_and_wait_for_sub_transactions(&self) {
        self.shared.lock().finishing = true;
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.lock().active_subs == 0 {
                return;
            }
            idle.await;
        }
    }

    fn commit(&self) -> Result<(), SpaceError> {
        self.finish(true)
    }

    fn rollback(&self) -> Result<(), SpaceError> {
        self.finish(false)
    }

    fn accessed_containers(&self) -> Vec<ContainerRef> {
        let state = self.shared.lock();
        state
            .accessed
            .iter()
            .copied()
            .chain(state.changes.iter().map(|change| change.container()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect()
    }
}

#[derive(Default)]
struct SubLog {
    finished: bool,
    changes: Vec<Change>,
    accessed: Vec<ContainerRef>,
}

pub struct InMemorySubTransaction {
    label: String,
    shared: Arc<TxShared>,
    log: Mutex<SubLog>,
}

impl InMemorySubTransaction {
    fn tx_label(&self) -> &str {
        &self.shared.label
    }

    fn record(&self, container: ContainerRef, changes: impl IntoIterator<Item = Change>) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.accessed.push(container);
        log.changes.extend(changes);
    }

    fn end(&self, commit: bool) -> Result<(), SpaceError> {
        let (changes, accessed) = {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            if log.finished {
                return Err(SpaceError::InvalidTransaction(format!(
                    "{} already finished",
                    self.label
                )));
            }
            log.finished = true;
            (
                std::mem::take(&mut log.changes),
                std::mem::take(&mut log.accessed),
            )
        };
        self.shared.end_sub(changes, accessed, commit);
        Ok(())
    }
}

impl SubTransaction for InMemorySubTransaction {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn commit(&self) -> Result<(), SpaceError> {
        self.end(true)
    }

    fn rollback(&self) -> Result<(), SpaceError> {
        self.end(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for InMemorySubTransaction {
    fn drop(&mut self) {
        let finished = self
            .log
            .get_mut()
            .map(|log| log.finished)
            .unwrap_or(true);
        if !finished {
            tracing::warn!(stx = %self.label, "sub-transaction dropped unfinished, rolling back");
            let _ = self.end(false);
        }
    }
}

fn own<'a>(stx: &'a dyn SubTransaction) -> Result<&'a InMemorySubTransaction, OperationResultError> {
    stx.as_any()
        .downcast_ref::<InMemorySubTransaction>()
        .ok_or_else(|| {
            OperationResultError::NotOk(OperationCause::Rejected {
                message: format!("sub-transaction {} is not from this space", stx.label()),
            })
        })
}

/// FIFO containers in memory.
pub struct InMemorySpace {
    state: Arc<Mutex<SpaceState>>,
    next_tx: AtomicU64,
}

impl InMemorySpace {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SpaceState::default())),
            next_tx: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpaceState> {
        lock_space(&self.state)
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Physically stored entries, committed or not.
    pub fn stored_entries(&self, container: ContainerRef) -> Option<usize> {
        self.lock()
            .containers
            .get(&container)
            .map(|stored| stored.entries.len())
    }

    fn pick(
        &self,
        container: ContainerRef,
        selector: &Selector,
        stx: &dyn SubTransaction,
        remove: bool,
    ) -> OperationResult<Vec<Entry>> {
        let stx = match own(stx) {
            Ok(stx) => stx,
            Err(err) => return err.into_result(),
        };
        let tx = stx.tx_label();
        let mut state = self.lock();
        let stored = match state.usable(container, tx) {
            Ok(stored) => stored,
            Err(err) => return err.into_result(),
        };
        let picked = match select(&stored.entries, selector, tx) {
            OperationResult::Ok(picked) => picked,
            other => return other.map(|_| Vec::new()),
        };

        let mut values = Vec::with_capacity(picked.len());
        let mut changes = Vec::new();
        for index in picked {
            let entry = &mut stored.entries[index];
            values.push(entry.value.clone());
            if remove {
                entry.taken_by = Some(tx.to_string());
                changes.push(Change::Took(container, entry.id));
            }
        }
        drop(state);
        stx.record(container, changes);
        OperationResult::Ok(values)
    }
}

impl Default for InMemorySpace {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationExecutor for InMemorySpace {
    fn new_transaction(&self) -> Arc<dyn Transaction> {
        let label = format!("mem-tx-{}", self.next_tx.fetch_add(1, Ordering::Relaxed));
        Arc::new(InMemoryTransaction {
            shared: Arc::new(TxShared {
                label,
                space: Arc::clone(&self.state),
                state: Mutex::new(TxState {
                    valid: true,
                    ..TxState::default()
                }),
                idle: Notify::new(),
            }),
        })
    }

    async fn write(
        &self,
        container: ContainerRef,
        entries: &[Entry],
        stx: &dyn SubTransaction,
    ) -> OperationResult<()> {
        let stx = match own(stx) {
            Ok(stx) => stx,
            Err(err) => return err.into_result(),
        };
        let tx = stx.tx_label();
        let mut state = self.lock();
        let first_id = state.next_entry;
        let stored = match state.usable(container, tx) {
            Ok(stored) => stored,
            Err(err) => return err.into_result(),
        };
        if let Some(capacity) = stored.capacity {
            let occupied = stored
                .entries
                .iter()
                .filter(|entry| entry.taken_by.as_deref() != Some(tx))
                .count();
            if occupied + entries.len() > capacity {
                return OperationResult::Delayable(OperationCause::ContainerFull { capacity });
            }
        }

        let mut changes = Vec::with_capacity(entries.len());
        for (offset, value) in entries.iter().enumerate() {
            let id = first_id + offset as u64;
            stored.entries.push(StoredEntry {
                id,
                value: value.clone(),
                written_by: Some(tx.to_string()),
                taken_by: None,
            });
            changes.push(Change::Wrote(container, id));
        }
        state.next_entry = first_id + entries.len() as u64;
        drop(state);
        stx.record(container, changes);
        OperationResult::Ok(())
    }

    async fn read(
        &self,
        container: ContainerRef,
        selector: &Selector,
        _isolation: IsolationLevel,
        stx: &dyn SubTransaction,
    ) -> OperationResult<Vec<Entry>> {
        self.pick(container, selector, stx, false)
    }

    async fn take(
        &self,
        container: ContainerRef,
        selector: &Selector,
        stx: &dyn SubTransaction,
    ) -> OperationResult<Vec<Entry>> {
        self.pick(container, selector, stx, true)
    }

    async fn test(
        &self,
        container: ContainerRef,
        selector: &Selector,
        _isolation: IsolationLevel,
        stx: &dyn SubTransaction,
    ) -> OperationResult<usize> {
        self.pick(container, selector, stx, false)
            .map(|entries| entries.len())
    }

    async fn delete(
        &self,
        container: ContainerRef,
        selector: &Selector,
        stx: &dyn SubTransaction,
    ) -> OperationResult<usize> {
        self.pick(container, selector, stx, true)
            .map(|entries| entries.len())
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
        stx: &dyn SubTransaction,
    ) -> OperationResult<ContainerRef> {
        let stx = match own(stx) {
            Ok(stx) => stx,
            Err(err) => return err.into_result(),
        };
        let tx = stx.tx_label();
        let mut state = self.lock();
        if let Some(name) = &spec.name {
            if state.names.contains_key(name) {
                return OperationResult::NotOk(OperationCause::NameNotAvailable {
                    name: name.clone(),
                });
            }
        }
        let container = ContainerRef::from_ulid(Ulid::new());
        if let Some(name) = &spec.name {
            state.names.insert(name.clone(), container);
        }
        state.containers.insert(
            container,
            StoredContainer {
                name: spec.name.clone(),
                capacity: spec.capacity,
                entries: Vec::new(),
                created_by: Some(tx.to_string()),
                destroyed_by: None,
                locked_by: None,
            },
        );
        drop(state);
        stx.record(container, [Change::Created(container)]);
        OperationResult::Ok(container)
    }

    async fn destroy_container(
        &self,
        container: ContainerRef,
        stx: &dyn SubTransaction,
    ) -> OperationResult<()> {
        let stx = match own(stx) {
            Ok(stx) => stx,
            Err(err) => return err.into_result(),
        };
        let tx = stx.tx_label();
        let mut state = self.lock();
        let stored = match state.usable(container, tx) {
            Ok(stored) => stored,
            Err(err) => return err.into_result(),
        };
        if let Some(holder) = pending_owner(stored, tx) {
            return OperationResult::Locked(LockCause::long_term(LockKind::Entry, holder));
        }
        stored.destroyed_by = Some(tx.to_string());
        drop(state);
        stx.record(container, [Change::Destroyed(container)]);
        OperationResult::Ok(())
    }

    async fn lookup_container(
        &self,
        name: &str,
        stx: &dyn SubTransaction,
    ) -> OperationResult<ContainerRef> {
        let stx = match own(stx) {
            Ok(stx) => stx,
            Err(err) => return err.into_result(),
        };
        let tx = stx.tx_label();
        let mut state = self.lock();
        let not_found = || {
            OperationResult::NotOk(OperationCause::ContainerNotFound {
                name: name.to_string(),
            })
        };
        let Some(container) = state.names.get(name).copied() else {
            return not_found();
        };
        match state.usable(container, tx) {
            Ok(_) => OperationResult::Ok(container),
            Err(OperationResultError::NotOk(_)) => not_found(),
            Err(err) => err.into_result(),
        }
    }

    async fn lock_container(
        &self,
        container: ContainerRef,
        stx: &dyn SubTransaction,
    ) -> OperationResult<()> {
        let stx = match own(stx) {
            Ok(stx) => stx,
            Err(err) => return err.into_result(),
        };
        let tx = stx.tx_label();
        let mut state = self.lock();
        let stored = match state.usable(container, tx) {
            Ok(stored) => stored,
            Err(err) => return err.into_result(),
        };
        if stored.locked_by.as_deref() == Some(tx) {
            return OperationResult::Ok(());
        }
        if let Some(holder) = pending_owner(stored, tx) {
            return OperationResult::Locked(LockCause::long_term(LockKind::Entry, holder));
        }
        stored.locked_by = Some(tx.to_string());
        drop(state);
        stx.record(container, [Change::Locked(container)]);
        OperationResult::Ok(())
    }
}

/// Another transaction with uncommitted entries in the container.
fn pending_owner(stored: &StoredContainer, tx: &str) -> Option<String> {
    stored.entries.iter().find_map(|entry| {
        entry
            .written_by
            .as_deref()
            .or(entry.taken_by.as_deref())
            .filter(|owner| *owner != tx)
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OperationStatus;
    use serde_json::json;
    use std::time::Duration;

    struct Op {
        tx: Arc<dyn Transaction>,
    }

    impl Op {
        fn new(space: &InMemorySpace) -> Self {
            Self {
                tx: space.new_transaction(),
            }
        }

        fn stx(&self) -> Arc<dyn SubTransaction> {
            self.tx.new_sub_transaction().unwrap()
        }
    }

    async fn container(space: &InMemorySpace, spec: ContainerSpec) -> ContainerRef {
        let op = Op::new(space);
        let stx = op.stx();
        let OperationResult::Ok(container) = space.create_container(&spec, stx.as_ref()).await
        else {
            panic!("create failed");
        };
        stx.commit().unwrap();
        op.tx.commit().unwrap();
        container
    }

    async fn write_committed(space: &InMemorySpace, container: ContainerRef, values: &[Entry]) {
        let op = Op::new(space);
        let stx = op.stx();
        assert_eq!(
            space.write(container, values, stx.as_ref()).await,
            OperationResult::Ok(())
        );
        stx.commit().unwrap();
        op.tx.commit().unwrap();
    }

    #[tokio::test]
    async fn uncommitted_writes_are_private() {
        let space = InMemorySpace::new();
        let c = container(&space, ContainerSpec::default()).await;
        let (writer, reader) = (Op::new(&space), Op::new(&space));

        let stx = writer.stx();
        space.write(c, &[json!(1)], stx.as_ref()).await;
        stx.commit().unwrap();

        let own_read = space
            .read(c, &Selector::any(1), IsolationLevel::ReadCommitted, writer.stx().as_ref())
            .await;
        assert_eq!(own_read, OperationResult::Ok(vec![json!(1)]));

        let other = space
            .read(c, &Selector::any(1), IsolationLevel::ReadCommitted, reader.stx().as_ref())
            .await;
        assert_eq!(other.status(), OperationStatus::Delayable);

        writer.tx.commit().unwrap();
        let after = space
            .read(c, &Selector::any(1), IsolationLevel::ReadCommitted, reader.stx().as_ref())
            .await;
        assert_eq!(after, OperationResult::Ok(vec![json!(1)]));
    }

    #[tokio::test]
    async fn taken_entries_are_locked_until_the_taker_ends() {
        let space = InMemorySpace::new();
        let c = container(&space, ContainerSpec::default()).await;
        write_committed(&space, c, &[json!("a")]).await;
        let (taker, other) = (Op::new(&space), Op::new(&space));

        let stx = taker.stx();
        assert_eq!(
            space.take(c, &Selector::any(1), stx.as_ref()).await,
            OperationResult::Ok(vec![json!("a")])
        );
        stx.commit().unwrap();

        let blocked = space.take(c, &Selector::any(1), other.stx().as_ref()).await;
        assert_eq!(
            blocked,
            OperationResult::Locked(LockCause::long_term(LockKind::Entry, taker.tx.label()))
        );

        taker.tx.rollback().unwrap();
        let stx = other.stx();
        assert_eq!(
            space.take(c, &Selector::any(1), stx.as_ref()).await,
            OperationResult::Ok(vec![json!("a")])
        );
        stx.commit().unwrap();
        assert_eq!(other.tx.accessed_containers(), vec![c]);
    }

    #[tokio::test]
    async fn committed_take_removes_the_entry() {
        let space = InMemorySpace::new();
        let c = container(&space, ContainerSpec::default()).await;
        write_committed(&space, c, &[json!(1), json!(2)]).await;

        let taker = Op::new(&space);
        let stx = taker.stx();
        assert_eq!(
            space.delete(c, &Selector::matching(json!(2), 1), stx.as_ref()).await,
            OperationResult::Ok(1)
        );
        stx.commit().unwrap();
        taker.tx.commit().unwrap();
        assert_eq!(space.stored_entries(c), Some(1));
    }

    #[tokio::test]
    async fn full_container_delays_writes() {
        let space = InMemorySpace::new();
        let c = container(&space, ContainerSpec::default().with_capacity(1)).await;
        write_committed(&space, c, &[json!(1)]).await;

        let op = Op::new(&space);
        assert_eq!(
            space.write(c, &[json!(2)], op.stx().as_ref()).await,
            OperationResult::Delayable(OperationCause::ContainerFull { capacity: 1 })
        );
    }

    #[tokio::test]
    async fn names_are_unique_and_uncommitted_creations_are_invisible() {
        let space = InMemorySpace::new();
        let creator = Op::new(&space);
        let stx = creator.stx();
        let OperationResult::Ok(created) = space
            .create_container(&ContainerSpec::named("jobs"), stx.as_ref())
            .await
        else {
            panic!("create failed");
        };
        stx.commit().unwrap();

        let other = Op::new(&space);
        assert_eq!(
            space.lookup_container("jobs", other.stx().as_ref()).await,
            OperationResult::NotOk(OperationCause::ContainerNotFound {
                name: "jobs".into()
            })
        );
        assert_eq!(
            space.lookup_container("jobs", creator.stx().as_ref()).await,
            OperationResult::Ok(created)
        );
        assert_eq!(
            space
                .create_container(&ContainerSpec::named("jobs"), other.stx().as_ref())
                .await,
            OperationResult::NotOk(OperationCause::NameNotAvailable {
                name: "jobs".into()
            })
        );

        creator.tx.rollback().unwrap();
        assert_eq!(space.container_count(), 0);
    }

    #[tokio::test]
    async fn container_lock_blocks_other_transactions() {
        let space = InMemorySpace::new();
        let c = container(&space, ContainerSpec::default()).await;
        let (owner, other) = (Op::new(&space), Op::new(&space));

        let stx = owner.stx();
        assert_eq!(space.lock_container(c, stx.as_ref()).await, OperationResult::Ok(()));
        stx.commit().unwrap();

        let blocked = space.write(c, &[json!(1)], other.stx().as_ref()).await;
        assert_eq!(blocked.status(), OperationStatus::Locked);

        owner.tx.commit().unwrap();
        assert_eq!(
            space.write(c, &[json!(1)], other.stx().as_ref()).await,
            OperationResult::Ok(())
        );
    }

    #[tokio::test]
    async fn destroyed_container_goes_away_on_commit() {
        let space = InMemorySpace::new();
        let c = container(&space, ContainerSpec::named("gone")).await;
        let op = Op::new(&space);
        let stx = op.stx();
        assert_eq!(space.destroy_container(c, stx.as_ref()).await, OperationResult::Ok(()));
        stx.commit().unwrap();
        assert_eq!(space.container_count(), 1);

        op.tx.commit().unwrap();
        assert_eq!(space.container_count(), 0);
        let fresh = Op::new(&space);
        let again = space
            .create_container(&ContainerSpec::named("gone"), fresh.stx().as_ref())
            .await;
        assert_eq!(again.status(), OperationStatus::Ok);
    }

    #[tokio::test]
    async fn sub_transaction_rollback_undoes_its_writes() {
        let space = InMemorySpace::new();
        let c = container(&space, ContainerSpec::default()).await;
        let op = Op::new(&space);

        let stx = op.stx();
        space.write(c, &[json!(1)], stx.as_ref()).await;
        assert_eq!(space.stored_entries(c), Some(1));
        stx.rollback().unwrap();
        assert_eq!(space.stored_entries(c), Some(0));
        assert!(stx.commit().is_err());
    }

    #[tokio::test]
    async fn finishing_waits_for_running_sub_transactions() {
        let space = InMemorySpace::new();
        let op = Op::new(&space);
        let stx = op.stx();

        let tx = Arc::clone(&op.tx);
        let waiter = tokio::spawn(async move { tx.lock_and_wait_for_sub_transactions().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(op.tx.new_sub_transaction().is_err());

        stx.commit().unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        op.tx.commit().unwrap();
        assert!(!op.tx.is_valid());
    }

    #[tokio::test]
    async fn foreign_sub_transactions_are_rejected() {
        struct Foreign;
        impl SubTransaction for Foreign {
            fn label(&self) -> String {
                "foreign".into()
            }
            fn commit(&self) -> Result<(), SpaceError> {
                Ok(())
            }
            fn rollback(&self) -> Result<(), SpaceError> {
                Ok(())
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let space = InMemorySpace::new();
        let result = space
            .write(ContainerRef::from_ulid(Ulid::new()), &[json!(1)], &Foreign)
            .await;
        assert_eq!(result.status(), OperationStatus::NotOk);
    }
}
