//! ExpiringElement - 期限付きの要素
//!
//! Ordering looks only at the deadline, equality and hashing only at the
//! element. Two entries for the same element with different deadlines are
//! "equal", which is what duplicate detection in the processors relies on.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExpiringElement<E> {
    element: E,
    deadline: Instant,
}

impl<E> ExpiringElement<E> {
    pub fn new(element: E, deadline: Instant) -> Self {
        Self { element, deadline }
    }

    /// Expires `timeout` from now.
    pub fn after(element: E, timeout: Duration) -> Self {
        Self::new(element, Instant::now() + timeout)
    }

    pub fn element(&self) -> &E {
        &self.element
    }

    pub fn into_element(self) -> E {
        self.element
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn delay(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

impl<E: PartialEq> PartialEq for ExpiringElement<E> {
    fn eq(&self, other: &Self) -> bool {
        self.element == other.element
    }
}

impl<E: Eq> Eq for ExpiringElement<E> {}

impl<E: Hash> Hash for ExpiringElement<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.element.hash(state);
    }
}

impl<E: Eq> PartialOrd for ExpiringElement<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E: Eq> Ord for ExpiringElement<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline.cmp(&other.deadline)
    }
}
