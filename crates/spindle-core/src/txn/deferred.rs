//! DeferredAction - トランザクション終了時に実行するコマンド
//!
//! Container bookkeeping only becomes final once the transaction's fate is
//! known. The registry applies the matching actions at commit or rollback.

use crate::domain::ContainerRef;
use crate::wait::WaitAndEventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    /// The container was created in the transaction.
    ForgetContainerOnRollback(ContainerRef),
    /// The container was destroyed in the transaction.
    ForgetContainerOnCommit(ContainerRef),
}

impl DeferredAction {
    pub fn applies_on(&self, resolution: Resolution) -> bool {
        matches!(
            (self, resolution),
            (DeferredAction::ForgetContainerOnRollback(_), Resolution::Rollback)
                | (DeferredAction::ForgetContainerOnCommit(_), Resolution::Commit)
        )
    }

    pub fn apply<T>(self, store: &WaitAndEventStore<T>) {
        match self {
            DeferredAction::ForgetContainerOnRollback(container)
            | DeferredAction::ForgetContainerOnCommit(container) => {
                tracing::debug!(container = %container, action = ?self, "applying deferred action");
                store.remove_container(container);
            }
        }
    }
}

/// Applies the actions matching `resolution`, in registration order.
pub(crate) fn apply_all<T>(
    actions: Vec<DeferredAction>,
    resolution: Resolution,
    store: &WaitAndEventStore<T>,
) {
    for action in actions {
        if action.applies_on(resolution) {
            action.apply(store);
        }
    }
}
