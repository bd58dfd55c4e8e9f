//! Domain model (IDs, requests, statuses, answers, errors).

pub mod answer;
pub mod category;
pub mod errors;
pub mod ids;
pub mod request;
pub mod status;

pub use answer::Answer;
pub use category::{EventCategory, merge_categories};
pub use errors::{ErrorKind, SpaceError};
pub use ids::{ContainerRef, RequestRef, SpaceId, TransactionRef, TxId};
pub use request::{
    ContainerSpec, Count, Entry, IsolationLevel, Origin, Request, RequestMessage, RequestTimeout,
    Selector, TransactionTimeout,
};
pub use status::{LockCause, LockKind, OperationCause, OperationResult, OperationStatus};
