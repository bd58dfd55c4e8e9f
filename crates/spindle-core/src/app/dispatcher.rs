//! Dispatcher - リクエストの受付とワーカー群
//!
//! Requests and resumed tasks go through one `RunQueue`. A fixed group of
//! worker tasks takes jobs from it and runs them. Each run is spawned on its
//! own tokio task so a panicking request is answered instead of taking its
//! worker down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{RequestMessage, SpaceError};
use crate::task::{Task, TaskContext};

use super::queue::{Job, RunQueue};

/// Worker group handle.
/// - `shutdown_tx` で全ワーカーに停止を通知
/// - `join()` で全ワーカーの終了を待てる
struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    fn spawn(n: usize, queue: RunQueue, ctx: Arc<TaskContext>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let queue = queue.clone();
            let ctx = Arc::clone(&ctx);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, queue, ctx, &mut rx).await;
            });
            joins.push(join);
        }

        Self { shutdown_tx, joins }
    }

    /// Waits for every worker to exit on its own; aborts the rest after `grace`.
    async fn join(self, grace: Duration) -> bool {
        let Self { shutdown_tx, joins } = self;
        let aborts: Vec<_> = joins.iter().map(JoinHandle::abort_handle).collect();
        let all = async {
            for join in joins {
                // ignore join error: a cancelled worker is fine here
                let _ = join.await;
            }
        };
        if tokio::time::timeout(grace, all).await.is_ok() {
            return true;
        }
        tracing::warn!(grace_ms = grace.as_millis() as u64, "workers did not drain in time, aborting");
        let _ = shutdown_tx.send(true);
        for abort in aborts {
            abort.abort();
        }
        false
    }

    fn abort(self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
        for join in self.joins {
            join.abort();
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: RunQueue,
    ctx: Arc<TaskContext>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    tracing::trace!(worker = worker_id, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let job = tokio::select! {
            _ = shutdown_rx.changed() => {
                // 変更が入ったら次のループで判定
                continue;
            }
            job = queue.next() => job,
        };

        // closed and drained
        let Some(job) = job else {
            break;
        };

        let task = match job {
            Job::Request(message) => Task::new(message, Arc::clone(&ctx)),
            Job::Resume(task) => task,
        };
        run_isolated(worker_id, task).await;
    }
    tracing::trace!(worker = worker_id, "worker stopped");
}

async fn run_isolated(worker_id: usize, task: Task) {
    let handle = tokio::spawn({
        let task = task.clone();
        async move { task.run().await }
    });
    match handle.await {
        Ok(()) => {}
        Err(err) if err.is_panic() => {
            tracing::error!(
                worker = worker_id,
                request = %task.request_ref(),
                "task panicked"
            );
            task.fail(SpaceError::Internal("request execution panicked".into()))
                .await;
        }
        Err(_) => {
            tracing::debug!(worker = worker_id, request = %task.request_ref(), "task run cancelled");
        }
    }
}

/// Entry point for requests and wakeups.
pub struct Dispatcher {
    queue: RunQueue,
    accepting: AtomicBool,
    workers: Mutex<Option<WorkerGroup>>,
}

impl Dispatcher {
    /// Spawns `workers` worker tasks. Needs a tokio runtime.
    pub fn start(workers: usize, queue: RunQueue, ctx: Arc<TaskContext>) -> Self {
        let group = WorkerGroup::spawn(workers, queue.clone(), ctx);
        tracing::debug!(workers, "dispatcher started");
        Self {
            queue,
            accepting: AtomicBool::new(true),
            workers: Mutex::new(Some(group)),
        }
    }

    /// Queues a client request.
    pub fn process_request(&self, message: RequestMessage) -> Result<(), SpaceError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SpaceError::ShuttingDown);
        }
        tracing::trace!(request = %message.request_ref, kind = message.request.name(), "request accepted");
        self.queue
            .push(Job::Request(message))
            .map_err(|_| SpaceError::ShuttingDown)
    }

    /// Queues a task for another attempt.
    pub fn reschedule_task(&self, task: Task) -> Result<(), SpaceError> {
        self.queue
            .push(Job::Resume(task))
            .map_err(|_| SpaceError::ShuttingDown)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Closes the queue and stops the workers.
    ///
    /// With `wait`, workers finish the jobs already queued (bounded by
    /// `grace`); otherwise they are aborted. Returns the jobs nobody ran.
    pub async fn shutdown(&self, wait: bool, grace: Duration) -> Vec<Job> {
        self.stop_accepting();
        self.queue.close();
        let group = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(group) = group {
            if wait {
                group.join(grace).await;
            } else {
                group.abort();
            }
        }
        let mut left = Vec::new();
        // closed, so next() only drains
        while let Some(job) = self.queue.next().await {
            left.push(job);
        }
        left
    }
}
