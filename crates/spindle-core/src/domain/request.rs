//! Request model - クライアントが発行する操作
//!
//! `Request` は閉じた enum なので、task への変換は match で網羅されます。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ids::{ContainerRef, RequestRef, TransactionRef};

/// Entry の値そのもの。マッチングは executor 側の責務。
pub type Entry = serde_json::Value;

/// How long a request may stay blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTimeout {
    /// Block until the request can complete.
    #[default]
    Infinite,
    /// Fail on DELAYABLE, but still wait on LOCKED (without a deadline).
    TryOnce,
    /// Never block.
    Zero,
    /// Block at most this many milliseconds.
    Millis(u64),
}

impl RequestTimeout {
    pub const INFINITE_MS: i64 = -1;
    pub const TRY_ONCE_MS: i64 = -2;

    /// Decodes the wire convention: -1 infinite, -2 try-once, 0 zero.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            Self::TRY_ONCE_MS => RequestTimeout::TryOnce,
            0 => RequestTimeout::Zero,
            ms if ms > 0 => RequestTimeout::Millis(ms as u64),
            _ => RequestTimeout::Infinite,
        }
    }

    /// The finite wait, if any.
    pub fn duration(self) -> Option<Duration> {
        match self {
            RequestTimeout::Millis(ms) => Some(Duration::from_millis(ms)),
            _ => None,
        }
    }
}

/// Lifetime of an explicit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionTimeout {
    Infinite,
    Millis(u64),
}

impl TransactionTimeout {
    pub fn duration(self) -> Option<Duration> {
        match self {
            TransactionTimeout::Infinite => None,
            TransactionTimeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Count {
    Exactly(usize),
    All,
}

/// Which entries an operation selects. Interpreted by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub count: Count,
    /// Only entries equal to this value match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Entry>,
}

impl Selector {
    pub fn any(count: usize) -> Self {
        Self {
            count: Count::Exactly(count),
            template: None,
        }
    }

    pub fn all() -> Self {
        Self {
            count: Count::All,
            template: None,
        }
    }

    pub fn matching(template: Entry, count: usize) -> Self {
        Self {
            count: Count::Exactly(count),
            template: Some(template),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    Repeatable,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Maximum number of entries; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

impl ContainerSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// One client operation.
///
/// `transaction: None` は implicit transaction（自動コミット）で実行される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Write {
        container: ContainerRef,
        entries: Vec<Entry>,
        #[serde(default)]
        timeout: RequestTimeout,
        #[serde(default)]
        transaction: Option<TransactionRef>,
    },
    Read {
        container: ContainerRef,
        selector: Selector,
        #[serde(default)]
        isolation: IsolationLevel,
        #[serde(default)]
        timeout: RequestTimeout,
        #[serde(default)]
        transaction: Option<TransactionRef>,
    },
    Take {
        container: ContainerRef,
        selector: Selector,
        #[serde(default)]
        timeout: RequestTimeout,
        #[serde(default)]
        transaction: Option<TransactionRef>,
    },
    Test {
        container: ContainerRef,
        selector: Selector,
        #[serde(default)]
        isolation: IsolationLevel,
        #[serde(default)]
        timeout: RequestTimeout,
        #[serde(default)]
        transaction: Option<TransactionRef>,
    },
    Delete {
        container: ContainerRef,
        selector: Selector,
        #[serde(default)]
        timeout: RequestTimeout,
        #[serde(default)]
        transaction: Option<TransactionRef>,
    },
    CreateContainer {
        spec: ContainerSpec,
        #[serde(default)]
        transaction: Option<TransactionRef>,
    },
    DestroyContainer {
        container: ContainerRef,
        #[serde(default)]
        transaction: Option<TransactionRef>,
    },
    LookupContainer {
        name: String,
        #[serde(default)]
        timeout: RequestTimeout,
        #[serde(default)]
        transaction: Option<TransactionRef>,
    },
    LockContainer {
        container: ContainerRef,
        #[serde(default)]
        transaction: Option<TransactionRef>,
    },
    CreateTransaction {
        timeout: TransactionTimeout,
    },
    CommitTransaction {
        transaction: TransactionRef,
    },
    RollbackTransaction {
        transaction: TransactionRef,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Write { .. } => "write",
            Request::Read { .. } => "read",
            Request::Take { .. } => "take",
            Request::Test { .. } => "test",
            Request::Delete { .. } => "delete",
            Request::CreateContainer { .. } => "create_container",
            Request::DestroyContainer { .. } => "destroy_container",
            Request::LookupContainer { .. } => "lookup_container",
            Request::LockContainer { .. } => "lock_container",
            Request::CreateTransaction { .. } => "create_transaction",
            Request::CommitTransaction { .. } => "commit_transaction",
            Request::RollbackTransaction { .. } => "rollback_transaction",
        }
    }

    /// Transaction management requests talk to the registry directly and
    /// never run inside a (sub-)transaction of their own.
    pub fn is_transactional(&self) -> bool {
        !matches!(
            self,
            Request::CreateTransaction { .. }
                | Request::CommitTransaction { .. }
                | Request::RollbackTransaction { .. }
        )
    }

    /// The explicit transaction a transactional request runs in.
    pub fn transaction(&self) -> Option<TransactionRef> {
        match self {
            Request::Write { transaction, .. }
            | Request::Read { transaction, .. }
            | Request::Take { transaction, .. }
            | Request::Test { transaction, .. }
            | Request::Delete { transaction, .. }
            | Request::CreateContainer { transaction, .. }
            | Request::DestroyContainer { transaction, .. }
            | Request::LookupContainer { transaction, .. }
            | Request::LockContainer { transaction, .. } => *transaction,
            Request::CreateTransaction { .. }
            | Request::CommitTransaction { .. }
            | Request::RollbackTransaction { .. } => None,
        }
    }

    /// The container the request targets before it runs.
    pub fn container(&self) -> Option<ContainerRef> {
        match self {
            Request::Write { container, .. }
            | Request::Read { container, .. }
            | Request::Take { container, .. }
            | Request::Test { container, .. }
            | Request::Delete { container, .. }
            | Request::DestroyContainer { container, .. }
            | Request::LockContainer { container, .. } => Some(*container),
            _ => None,
        }
    }

    /// The timeout the caller asked for.
    pub fn timeout(&self) -> RequestTimeout {
        match self {
            Request::Write { timeout, .. }
            | Request::Read { timeout, .. }
            | Request::Take { timeout, .. }
            | Request::Test { timeout, .. }
            | Request::Delete { timeout, .. }
            | Request::LookupContainer { timeout, .. } => *timeout,
            Request::CreateContainer { .. }
            | Request::DestroyContainer { .. }
            | Request::LockContainer { .. } => RequestTimeout::Zero,
            Request::CreateTransaction { .. }
            | Request::CommitTransaction { .. }
            | Request::RollbackTransaction { .. } => RequestTimeout::Infinite,
        }
    }
}

/// Who issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Client,
    /// Synthesized by the runtime itself (e.g. rollback of a timed-out transaction).
    Internal,
}

/// A request together with its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub request_ref: RequestRef,
    pub request: Request,
    pub origin: Origin,
}

impl RequestMessage {
    pub fn client(request_ref: RequestRef, request: Request) -> Self {
        Self {
            request_ref,
            request,
            origin: Origin::Client,
        }
    }

    pub fn internal(request_ref: RequestRef, request: Request) -> Self {
        Self {
            request_ref,
            request,
            origin: Origin::Internal,
        }
    }
}
