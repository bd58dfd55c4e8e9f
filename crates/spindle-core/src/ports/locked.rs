//! LockedTaskHandler port - 長期ロック待ちタスクの通知先
//!
//! Hook for deadlock detection. A task parked on `UnlockLongTerm` is
//! reported with the transaction it waits for; it is withdrawn again when
//! the task is rescheduled.

use crate::domain::{LockCause, RequestRef};

pub trait LockedTaskHandler: Send + Sync {
    fn task_locked(&self, request: RequestRef, waiting_tx: &str, cause: &LockCause);

    fn task_unlocked(&self, request: RequestRef);
}

/// Default handler: no deadlock detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDeadlockDetection;

impl LockedTaskHandler for NoDeadlockDetection {
    fn task_locked(&self, _request: RequestRef, _waiting_tx: &str, _cause: &LockCause) {}

    fn task_unlocked(&self, _request: RequestRef) {}
}
