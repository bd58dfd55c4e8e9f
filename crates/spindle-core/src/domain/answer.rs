//! Answer - 成功時の応答値

use serde::{Deserialize, Serialize};

use super::ids::{ContainerRef, TransactionRef};
use super::request::Entry;

/// Successful result of a request, delivered through the response sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Answer {
    /// Write, commit, rollback, destroy and lock.
    Done,
    /// Read and take.
    Entries(Vec<Entry>),
    /// Test and delete.
    Count(usize),
    /// Create and lookup container.
    Container(ContainerRef),
    /// Create transaction.
    Transaction(TransactionRef),
}

impl Answer {
    pub fn into_entries(self) -> Option<Vec<Entry>> {
        match self {
            Answer::Entries(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn container(&self) -> Option<ContainerRef> {
        match self {
            Answer::Container(container) => Some(*container),
            _ => None,
        }
    }

    pub fn transaction(&self) -> Option<TransactionRef> {
        match self {
            Answer::Transaction(tx) => Some(*tx),
            _ => None,
        }
    }
}
