//! Timeout processors - 期限切れ要素の通知
//!
//! A processor holds expiring elements and hands each one to its handler
//! once its deadline passes. Two interchangeable implementations:
//! - `BlockingTimeoutProcessor`: dedicated thread sleeping until the next deadline
//! - `PollingTimeoutProcessor`: tokio task checking on a fixed interval
//!
//! An element is extracted under the processor lock before the handler runs,
//! so a handler fires at most once per add, and a successful
//! `remove_element` means it will not fire.

mod blocking;
mod expiring;
mod polling;
mod queue;

pub use blocking::BlockingTimeoutProcessor;
pub use expiring::ExpiringElement;
pub use polling::PollingTimeoutProcessor;

use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use queue::DeadlineQueue;

/// Called with each expired element.
pub trait TimeoutHandler<E>: Send + Sync {
    fn element_timed_out(&self, element: E);
}

impl<E, F> TimeoutHandler<E> for F
where
    F: Fn(E) + Send + Sync,
{
    fn element_timed_out(&self, element: E) {
        self(element)
    }
}

pub trait TimeoutProcessor<E>: Send + Sync {
    fn name(&self) -> &str;

    /// Adding an element that is already present replaces its deadline.
    fn add_element(&self, element: ExpiringElement<E>);

    /// Returns whether the element was still pending.
    fn remove_element(&self, element: &E) -> bool;

    fn set_timeout_handler(&self, handler: Arc<dyn TimeoutHandler<E>>);

    /// Number of pending elements.
    fn pending(&self) -> usize;

    /// Drops every pending element and stops the processor.
    fn shutdown(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TimeoutProcessorError {
    #[error("failed to spawn timeout thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("polling timeout processor {0} needs a tokio runtime")]
    NoRuntime(String),
}

struct CoreState<E> {
    queue: DeadlineQueue<E>,
    shut_down: bool,
}

/// State shared by both implementations.
struct ProcessorCore<E> {
    name: String,
    state: Mutex<CoreState<E>>,
    handler: RwLock<Option<Arc<dyn TimeoutHandler<E>>>>,
}

impl<E: Eq + Hash + Clone> ProcessorCore<E> {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CoreState {
                queue: DeadlineQueue::new(),
                shut_down: false,
            }),
            handler: RwLock::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, element: ExpiringElement<E>) -> bool {
        let mut state = self.lock();
        if state.shut_down {
            tracing::debug!(processor = %self.name, "ignoring element added after shutdown");
            return false;
        }
        state.queue.insert(element);
        true
    }

    fn remove(&self, element: &E) -> bool {
        self.lock().queue.remove(element)
    }

    fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn set_handler(&self, handler: Arc<dyn TimeoutHandler<E>>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Marks the processor as shut down; returns false if it already was.
    fn close(&self) -> bool {
        let mut state = self.lock();
        if state.shut_down {
            return false;
        }
        state.shut_down = true;
        let dropped = state.queue.clear();
        tracing::debug!(processor = %self.name, dropped, "timeout processor shut down");
        true
    }

    /// Invokes the handler outside the state lock.
    fn fire(&self, expired: Vec<E>) {
        if expired.is_empty() {
            return;
        }
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            tracing::warn!(
                processor = %self.name,
                dropped = expired.len(),
                "no timeout handler set, dropping expired elements"
            );
            return;
        };
        for element in expired {
            tracing::trace!(processor = %self.name, "element timed out");
            handler.element_timed_out(element);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Clone, Copy, Debug)]
    enum Kind {
        Blocking,
        Polling,
    }

    fn start(kind: Kind) -> Arc<dyn TimeoutProcessor<u32>> {
        match kind {
            Kind::Blocking => Arc::new(BlockingTimeoutProcessor::start("Test-TP").unwrap()),
            Kind::Polling => Arc::new(
                PollingTimeoutProcessor::start("Test-TP", Duration::from_millis(10)).unwrap(),
            ),
        }
    }

    fn recording_handler() -> (Arc<Mutex<Vec<u32>>>, Arc<dyn TimeoutHandler<u32>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let handler: Arc<dyn TimeoutHandler<u32>> =
            Arc::new(move |element: u32| sink.lock().unwrap().push(element));
        (fired, handler)
    }

    #[rstest]
    #[case(Kind::Blocking)]
    #[case(Kind::Polling)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fires_each_element_once_in_deadline_order(#[case] kind: Kind) {
        let processor = start(kind);
        let (fired, handler) = recording_handler();
        processor.set_timeout_handler(handler);

        let now = Instant::now();
        processor.add_element(ExpiringElement::new(2, now + Duration::from_millis(60)));
        processor.add_element(ExpiringElement::new(1, now + Duration::from_millis(20)));
        assert_eq!(processor.pending(), 2);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*fired.lock().unwrap(), vec![1, 2]);
        assert_eq!(processor.pending(), 0);
        processor.shutdown();
    }

    #[rstest]
    #[case(Kind::Blocking)]
    #[case(Kind::Polling)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removed_element_never_fires(#[case] kind: Kind) {
        let processor = start(kind);
        let (fired, handler) = recording_handler();
        processor.set_timeout_handler(handler);

        processor.add_element(ExpiringElement::after(9, Duration::from_millis(50)));
        assert!(processor.remove_element(&9));
        assert!(!processor.remove_element(&9));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fired.lock().unwrap().is_empty());
        processor.shutdown();
    }

    #[rstest]
    #[case(Kind::Blocking)]
    #[case(Kind::Polling)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_after_firing_reports_false(#[case] kind: Kind) {
        let processor = start(kind);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        processor.set_timeout_handler(Arc::new(move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        processor.add_element(ExpiringElement::after(3, Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!processor.remove_element(&3));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        processor.shutdown();
    }

    #[rstest]
    #[case(Kind::Blocking)]
    #[case(Kind::Polling)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_drops_pending_elements(#[case] kind: Kind) {
        let processor = start(kind);
        let (fired, handler) = recording_handler();
        processor.set_timeout_handler(handler);

        processor.add_element(ExpiringElement::after(4, Duration::from_millis(30)));
        processor.shutdown();
        processor.add_element(ExpiringElement::after(5, Duration::from_millis(1)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.lock().unwrap().is_empty());
        assert_eq!(processor.pending(), 0);
    }
}
