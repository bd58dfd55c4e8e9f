//! ResponseSink port - 応答の配送先

use crate::domain::{Answer, RequestRef, SpaceError};

/// Receives the single answer of each request.
///
/// 呼ばれるのは request ごとに高々 1 回。未知の request_ref は無視してよい。
pub trait ResponseSink: Send + Sync {
    fn deliver(&self, request: RequestRef, answer: Result<Answer, SpaceError>);
}
