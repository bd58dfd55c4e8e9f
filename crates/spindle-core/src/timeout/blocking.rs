//! BlockingTimeoutProcessor - 専用スレッドで待機する実装
//!
//! Mutex + Condvar: the thread sleeps until the earliest deadline and is
//! woken early whenever an element is added or the processor shuts down.

use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use super::{
    ExpiringElement, ProcessorCore, TimeoutHandler, TimeoutProcessor, TimeoutProcessorError,
};

pub struct BlockingTimeoutProcessor<E> {
    core: Arc<ProcessorCore<E>>,
    wakeup: Arc<Condvar>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<E> BlockingTimeoutProcessor<E>
where
    E: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn start(name: impl Into<String>) -> Result<Self, TimeoutProcessorError> {
        let core = Arc::new(ProcessorCore::new(name));
        let wakeup = Arc::new(Condvar::new());

        let thread = std::thread::Builder::new()
            .name(core.name.clone())
            .spawn({
                let core = Arc::clone(&core);
                let wakeup = Arc::clone(&wakeup);
                move || run(&core, &wakeup)
            })
            .map_err(|source| TimeoutProcessorError::Spawn {
                name: core.name.clone(),
                source,
            })?;

        Ok(Self {
            core,
            wakeup,
            thread: Mutex::new(Some(thread)),
        })
    }
}

fn run<E: Eq + Hash + Clone>(core: &ProcessorCore<E>, wakeup: &Condvar) {
    tracing::debug!(processor = %core.name, "timeout thread started");
    let mut state = core.lock();
    loop {
        if state.shut_down {
            break;
        }
        let now = Instant::now();
        match state.queue.next_deadline() {
            None => {
                state = wakeup.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) if deadline > now => {
                state = wakeup
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Some(_) => {
                let expired = state.queue.pop_expired(now);
                drop(state);
                core.fire(expired);
                state = core.lock();
            }
        }
    }
    tracing::debug!(processor = %core.name, "timeout thread stopped");
}

impl<E> TimeoutProcessor<E> for BlockingTimeoutProcessor<E>
where
    E: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.core.name
    }

    fn add_element(&self, element: ExpiringElement<E>) {
        if self.core.add(element) {
            self.wakeup.notify_one();
        }
    }

    fn remove_element(&self, element: &E) -> bool {
        self.core.remove(element)
    }

    fn set_timeout_handler(&self, handler: Arc<dyn TimeoutHandler<E>>) {
        self.core.set_handler(handler);
    }

    fn pending(&self) -> usize {
        self.core.pending()
    }

    fn shutdown(&self) {
        if !self.core.close() {
            return;
        }
        self.wakeup.notify_all();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // shutdown may be requested from inside a handler running on the timeout thread
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            tracing::error!(processor = %self.core.name, "timeout thread panicked");
        }
    }
}

impl<E> Drop for BlockingTimeoutProcessor<E> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.core.state.lock() {
            state.shut_down = true;
        }
        self.wakeup.notify_all();
    }
}
