//! PollingTimeoutProcessor - 一定間隔でチェックする実装
//!
//! Runs as a tokio task, so many processors share the runtime's threads.
//! Latency is bounded by the poll interval.

use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{
    ExpiringElement, ProcessorCore, TimeoutHandler, TimeoutProcessor, TimeoutProcessorError,
};

pub struct PollingTimeoutProcessor<E> {
    core: Arc<ProcessorCore<E>>,
    interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<E> PollingTimeoutProcessor<E>
where
    E: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Must be called from within a tokio runtime.
    pub fn start(
        name: impl Into<String>,
        interval: Duration,
    ) -> Result<Self, TimeoutProcessorError> {
        let core = Arc::new(ProcessorCore::new(name));
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TimeoutProcessorError::NoRuntime(core.name.clone()))?;

        let poller = runtime.spawn({
            let core = Arc::clone(&core);
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let expired = {
                        let mut state = core.lock();
                        if state.shut_down {
                            break;
                        }
                        state.queue.pop_expired(Instant::now())
                    };
                    core.fire(expired);
                }
            }
        });

        Ok(Self {
            core,
            interval,
            poller: Mutex::new(Some(poller)),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl<E> TimeoutProcessor<E> for PollingTimeoutProcessor<E>
where
    E: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.core.name
    }

    fn add_element(&self, element: ExpiringElement<E>) {
        self.core.add(element);
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
        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            poller.abort();
        }
    }
}

impl<E> Drop for PollingTimeoutProcessor<E> {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.lock()
            && let Some(poller) = poller.take()
        {
            poller.abort();
        }
    }
}
