//! Wakeup paths into the run queue.
//!
//! - `TaskRescheduler`: the wait store woke or refused a task
//! - `RequestTimeoutHandler`: a parked task's deadline passed

use std::sync::Arc;

use crate::domain::{EventCategory, SpaceError};
use crate::ports::LockedTaskHandler;
use crate::task::Task;
use crate::timeout::{TimeoutHandler, TimeoutProcessor};
use crate::wait::{ParkedTask, Rescheduler, WaitAndEventStore};

use super::queue::{Job, RunQueue};

fn resume(queue: &RunQueue, task: Task) {
    if let Err(Job::Resume(task)) = queue.push(Job::Resume(task)) {
        // the worker that would run it is gone
        if !task.try_fail(SpaceError::ShuttingDown) {
            tracing::debug!(request = %task.request_ref(), "task resumed after shutdown is answered by its running attempt");
        }
    }
}

pub struct TaskRescheduler {
    queue: RunQueue,
    request_timeouts: Arc<dyn TimeoutProcessor<Task>>,
    locked_tasks: Arc<dyn LockedTaskHandler>,
}

impl TaskRescheduler {
    pub fn new(
        queue: RunQueue,
        request_timeouts: Arc<dyn TimeoutProcessor<Task>>,
        locked_tasks: Arc<dyn LockedTaskHandler>,
    ) -> Self {
        Self {
            queue,
            request_timeouts,
            locked_tasks,
        }
    }
}

impl Rescheduler<Task> for TaskRescheduler {
    fn reschedule(&self, parked: ParkedTask<Task>) {
        if parked.can_time_out && !self.request_timeouts.remove_element(&parked.handle) {
            // woken before it was armed, or while its deadline fired
            tracing::info!(
                request = %parked.request,
                "woken task was not registered for its deadline"
            );
        }
        if parked.category == EventCategory::UnlockLongTerm {
            self.locked_tasks.task_unlocked(parked.request);
        }
        resume(&self.queue, parked.handle);
    }
}

pub struct RequestTimeoutHandler {
    queue: RunQueue,
    wait_store: Arc<WaitAndEventStore<Task>>,
    locked_tasks: Arc<dyn LockedTaskHandler>,
}

impl RequestTimeoutHandler {
    pub fn new(
        queue: RunQueue,
        wait_store: Arc<WaitAndEventStore<Task>>,
        locked_tasks: Arc<dyn LockedTaskHandler>,
    ) -> Self {
        Self {
            queue,
            wait_store,
            locked_tasks,
        }
    }
}

impl TimeoutHandler<Task> for RequestTimeoutHandler {
    fn element_timed_out(&self, task: Task) {
        tracing::debug!(request = %task.request_ref(), "request deadline passed");
        if let Some(parked) = self.wait_store.remove_task(task.request_ref()) {
            if parked.category == EventCategory::UnlockLongTerm {
                self.locked_tasks.task_unlocked(parked.request);
            }
        }
        // the next run answers with a timeout
        resume(&self.queue, task);
    }
}
