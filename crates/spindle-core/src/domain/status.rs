//! Operation status model at the executor boundary.
//!
//! The executor answers every operation with one of four statuses.
//! `OperationResult<T>` carries the status together with its payload so a
//! LOCKED answer always has a lock cause and an OK answer always has a value.

use serde::{Deserialize, Serialize};

use super::category::EventCategory;

/// Plain status code, used for logging and task bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Ok,
    /// Permanent failure.
    NotOk,
    /// Conflicting lock; may succeed once the lock is released.
    Locked,
    /// Cannot complete now (no match, container full); may succeed later.
    Delayable,
}

impl OperationStatus {
    pub fn is_retryable(self) -> bool {
        matches!(self, OperationStatus::Locked | OperationStatus::Delayable)
    }
}

/// What kind of object holds the conflicting lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Entry,
    Container,
    Coordinator,
}

/// Who holds a conflicting lock.
///
/// `holding_sub_tx` が None のときはトランザクション終了まで保持される長期ロック。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockCause {
    pub kind: LockKind,
    pub holding_tx: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holding_sub_tx: Option<String>,
}

impl LockCause {
    pub fn long_term(kind: LockKind, holding_tx: impl Into<String>) -> Self {
        Self {
            kind,
            holding_tx: holding_tx.into(),
            holding_sub_tx: None,
        }
    }

    pub fn short_term(
        kind: LockKind,
        holding_tx: impl Into<String>,
        holding_sub_tx: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            holding_tx: holding_tx.into(),
            holding_sub_tx: Some(holding_sub_tx.into()),
        }
    }

    /// The category a task blocked by this lock has to wait for.
    pub fn wait_category(&self) -> EventCategory {
        match self.holding_sub_tx {
            None => EventCategory::UnlockLongTerm,
            Some(_) => EventCategory::UnlockShortTerm,
        }
    }
}

impl std::fmt::Display for LockCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} locked by {}", self.kind, self.holding_tx)?;
        if let Some(sub) = &self.holding_sub_tx {
            write!(f, "/{sub}")?;
        }
        Ok(())
    }
}

/// Reason attached to NOTOK and DELAYABLE answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum OperationCause {
    #[error("not enough entries: needed {needed}, available {available}")]
    NotEnoughEntries { needed: usize, available: usize },

    #[error("container is full (capacity {capacity})")]
    ContainerFull { capacity: usize },

    #[error("container not found: {name}")]
    ContainerNotFound { name: String },

    #[error("container name already in use: {name}")]
    NameNotAvailable { name: String },

    #[error("{message}")]
    Rejected { message: String },
}

/// Result of one executor operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult<T> {
    Ok(T),
    NotOk(OperationCause),
    Locked(LockCause),
    Delayable(OperationCause),
}

impl<T> OperationResult<T> {
    pub fn status(&self) -> OperationStatus {
        match self {
            OperationResult::Ok(_) => OperationStatus::Ok,
            OperationResult::NotOk(_) => OperationStatus::NotOk,
            OperationResult::Locked(_) => OperationStatus::Locked,
            OperationResult::Delayable(_) => OperationStatus::Delayable,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        match self {
            OperationResult::Ok(value) => OperationResult::Ok(f(value)),
            OperationResult::NotOk(cause) => OperationResult::NotOk(cause),
            OperationResult::Locked(cause) => OperationResult::Locked(cause),
            OperationResult::Delayable(cause) => OperationResult::Delayable(cause),
        }
    }
}
