//! RunQueue - ワーカーに渡すジョブのキュー
//!
//! # 実装詳細
//! - Mutex<VecDeque<Job>> で FIFO を保持
//! - tokio::sync::Notify で push 時に待機中のワーカーを起こす
//! - close() 後は push を拒否し、空になった時点で next() が None を返す

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::domain::{Request, RequestMessage, SpaceError};
use crate::ports::IdGenerator;
use crate::task::Task;
use crate::txn::InternalRequests;

/// One unit of work for a worker.
#[derive(Debug)]
pub enum Job {
    /// A request that has no task yet.
    Request(RequestMessage),
    /// A task woken from the wait store, or refused by it.
    Resume(Task),
}

struct QueueState {
    jobs: VecDeque<Job>,
    closed: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Cloneable handle; all clones share one queue.
#[derive(Clone)]
pub struct RunQueue {
    inner: Arc<QueueInner>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a job; hands it back if the queue is closed.
    pub fn push(&self, job: Job) -> Result<(), Job> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(job);
            }
            state.jobs.push_back(job);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Waits for the next job. None once the queue is closed and drained.
    pub async fn next(&self) -> Option<Job> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before looking, so a close() in between is not missed
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(job) = state.jobs.pop_front() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuses further jobs. Jobs already queued are still handed out.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds requests the runtime issues itself (e.g. the rollback of a timed-out
/// transaction) into the run queue.
pub struct InternalSubmitter {
    queue: RunQueue,
    ids: Arc<dyn IdGenerator>,
}

impl InternalSubmitter {
    pub fn new(queue: RunQueue, ids: Arc<dyn IdGenerator>) -> Self {
        Self { queue, ids }
    }
}

impl InternalRequests for InternalSubmitter {
    fn submit_internal(&self, request: Request) -> Result<(), SpaceError> {
        let message = RequestMessage::internal(self.ids.generate_request_ref(), request);
        tracing::debug!(request = %message.request_ref, kind = message.request.name(), "submitting internal request");
        self.queue
            .push(Job::Request(message))
            .map_err(|_| SpaceError::ShuttingDown)
    }
}
