//! ResponseCollector - 応答を呼び出し元の oneshot に届ける
//!
//! # 実装詳細
//! - HashMap<RequestRef, oneshot::Sender> を Mutex で保護
//! - register() で受け口を作り、deliver() で取り出して送信
//! - 登録のない応答（内部リクエストなど）は fallback に流すか破棄

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::domain::{Answer, RequestRef, SpaceError};
use crate::ports::ResponseSink;

type Reply = Result<Answer, SpaceError>;

/// The answer of one submitted request, once it arrives.
#[derive(Debug)]
pub struct PendingAnswer {
    request_ref: RequestRef,
    receiver: oneshot::Receiver<Reply>,
}

impl PendingAnswer {
    pub fn request_ref(&self) -> RequestRef {
        self.request_ref
    }

    /// Waits for the answer. A runtime that went away without answering
    /// counts as shutting down.
    pub async fn wait(self) -> Reply {
        self.receiver.await.unwrap_or(Err(SpaceError::ShuttingDown))
    }
}

pub struct ResponseCollector {
    waiting: Mutex<HashMap<RequestRef, oneshot::Sender<Reply>>>,
    fallback: Option<Arc<dyn ResponseSink>>,
}

impl ResponseCollector {
    pub fn new(fallback: Option<Arc<dyn ResponseSink>>) -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestRef, oneshot::Sender<Reply>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, request_ref: RequestRef) -> PendingAnswer {
        let (sender, receiver) = oneshot::channel();
        if self.lock().insert(request_ref, sender).is_some() {
            tracing::warn!(request = %request_ref, "request registered twice, earlier caller loses its answer");
        }
        PendingAnswer {
            request_ref,
            receiver,
        }
    }

    pub fn forget(&self, request_ref: RequestRef) {
        self.lock().remove(&request_ref);
    }

    pub fn awaiting(&self) -> usize {
        self.lock().len()
    }

    /// Drops every outstanding receiver end; their callers see `ShuttingDown`.
    pub fn abandon_all(&self) -> usize {
        let abandoned = self.lock().drain().count();
        if abandoned > 0 {
            tracing::warn!(abandoned, "requests left without an answer");
        }
        abandoned
    }
}

impl ResponseSink for ResponseCollector {
    fn deliver(&self, request: RequestRef, answer: Reply) {
        let sender = self.lock().remove(&request);
        match sender {
            Some(sender) => {
                if sender.send(answer).is_err() {
                    tracing::debug!(request = %request, "caller stopped waiting for the answer");
                }
            }
            None => match &self.fallback {
                Some(fallback) => fallback.deliver(request, answer),
                None => tracing::debug!(request = %request, "no caller waiting for answer, dropping"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<RequestRef>>);

    impl ResponseSink for Recorder {
        fn deliver(&self, request: RequestRef, _answer: Reply) {
            self.0.lock().unwrap().push(request);
        }
    }

    #[tokio::test]
    async fn registered_caller_receives_its_answer() {
        let collector = ResponseCollector::new(None);
        let request = RequestRef::from_ulid(Ulid::new());
        let pending = collector.register(request);
        assert_eq!(collector.awaiting(), 1);

        collector.deliver(request, Ok(Answer::Count(3)));
        assert_eq!(pending.request_ref(), request);
        assert_eq!(pending.wait().await, Ok(Answer::Count(3)));
        assert_eq!(collector.awaiting(), 0);
    }

    #[tokio::test]
    async fn unclaimed_answers_go_to_the_fallback() {
        let fallback = Arc::new(Recorder::default());
        let collector = ResponseCollector::new(Some(fallback.clone()));
        let request = RequestRef::from_ulid(Ulid::new());

        collector.deliver(request, Ok(Answer::Done));
        assert_eq!(*fallback.0.lock().unwrap(), vec![request]);
    }

    #[tokio::test]
    async fn abandoned_callers_see_shutdown() {
        let collector = ResponseCollector::new(None);
        let pending = collector.register(RequestRef::from_ulid(Ulid::new()));
        assert_eq!(collector.abandon_all(), 1);
        assert_eq!(pending.wait().await, Err(SpaceError::ShuttingDown));
    }
}
