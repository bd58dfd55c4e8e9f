//! Errors - エラー型と分類
//!
//! `SpaceError` はリクエストの応答として呼び出し側に返るので `Clone` を実装します。

use super::ids::{RequestRef, TransactionRef};
use super::status::{LockCause, OperationCause};

/// ErrorKind は失敗の運用分類
///
/// - Permanent: NOTOK など、リトライしても無意味
/// - Retryable: LOCKED / DELAYABLE だが timeout policy が待機を許さなかった
/// - Timeout: request の待機時間切れ
/// - Transaction: 無効 / 他 space / timeout 済みのトランザクション
/// - Infrastructure: shutdown や内部不整合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Permanent,
    Retryable,
    Timeout,
    Transaction,
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpaceError {
    #[error("request {request} timed out after {waited_ms} ms")]
    Timeout { request: RequestRef, waited_ms: u64 },

    #[error("operation failed: {0}")]
    Operation(OperationCause),

    #[error("operation refused: {0}")]
    Locked(LockCause),

    #[error("transaction {0} has timed out")]
    TransactionTimedOut(TransactionRef),

    #[error("transaction {0} is not from this space")]
    ForeignTransaction(TransactionRef),

    #[error("no transaction for reference {0}")]
    UnknownTransaction(TransactionRef),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SpaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpaceError::Timeout { .. } => ErrorKind::Timeout,
            SpaceError::Operation(OperationCause::NotEnoughEntries { .. })
            | SpaceError::Operation(OperationCause::ContainerFull { .. })
            | SpaceError::Locked(_) => ErrorKind::Retryable,
            SpaceError::Operation(_) => ErrorKind::Permanent,
            SpaceError::TransactionTimedOut(_)
            | SpaceError::ForeignTransaction(_)
            | SpaceError::UnknownTransaction(_)
            | SpaceError::InvalidTransaction(_) => ErrorKind::Transaction,
            SpaceError::ShuttingDown | SpaceError::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}
