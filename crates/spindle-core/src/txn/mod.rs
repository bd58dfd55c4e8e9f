//! Transactions - 参照登録、タイムアウト、終了時の起床

mod deferred;
mod registry;

pub use deferred::{DeferredAction, Resolution};
pub use registry::{InternalRequests, TransactionInfo, TransactionRegistry};
