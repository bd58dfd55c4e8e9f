//! DeadlineQueue - 期限順のキュー
//!
//! Min-heap over deadlines plus a map of live elements. Removal only drops
//! the map entry; the stale heap slot is skipped when it surfaces, or purged
//! once stale slots outnumber live ones. An element has at most one live
//! deadline: adding it again replaces it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

use super::ExpiringElement;

/// Stale slots tolerated before the heap is rebuilt.
const COMPACT_SLACK: usize = 64;

/// Heap slot. Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
struct Slot<E> {
    expiring: ExpiringElement<E>,
    seq: u64,
}

impl<E: Eq> PartialEq for Slot<E> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<E: Eq> Eq for Slot<E> {}

impl<E: Eq> PartialOrd for Slot<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E: Eq> Ord for Slot<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expiring
            .cmp(&self.expiring)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct DeadlineQueue<E> {
    heap: BinaryHeap<Slot<E>>,
    live: HashMap<E, u64>,
    next_seq: u64,
}

impl<E: Eq + Hash + Clone> DeadlineQueue<E> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Returns true when an earlier deadline for the same element was replaced.
    pub(crate) fn insert(&mut self, expiring: ExpiringElement<E>) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        let replaced = self.live.insert(expiring.element().clone(), seq).is_some();
        self.heap.push(Slot { expiring, seq });
        if replaced {
            self.compact_if_stale();
        }
        replaced
    }

    pub(crate) fn remove(&mut self, element: &E) -> bool {
        let removed = self.live.remove(element).is_some();
        if removed {
            self.compact_if_stale();
        }
        removed
    }

    /// Drops stale slots so removed elements are not kept alive until their deadline.
    fn compact_if_stale(&mut self) {
        if self.heap.len() <= COMPACT_SLACK + 2 * self.live.len() {
            return;
        }
        let live = &self.live;
        self.heap
            .retain(|slot| live.get(slot.expiring.element()) == Some(&slot.seq));
    }

    /// Extracts every live element whose deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<E> {
        let mut expired = Vec::new();
        while let Some(slot) = self.heap.peek() {
            if !slot.expiring.is_expired(now) {
                break;
            }
            let Some(slot) = self.heap.pop() else { break };
            if self.live.get(slot.expiring.element()) == Some(&slot.seq) {
                self.live.remove(slot.expiring.element());
                expired.push(slot.expiring.into_element());
            }
        }
        expired
    }

    /// Earliest live deadline.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(slot) = self.heap.peek() {
            if self.live.get(slot.expiring.element()) == Some(&slot.seq) {
                return Some(slot.expiring.deadline());
            }
            self.heap.pop();
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.live.len();
        self.live.clear();
        self.heap.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.insert(ExpiringElement::new("b", now + Duration::from_millis(2)));
        queue.insert(ExpiringElement::new("a", now + Duration::from_millis(1)));
        queue.insert(ExpiringElement::new("c", now + Duration::from_secs(60)));

        let expired = queue.pop_expired(now + Duration::from_millis(5));
        assert_eq!(expired, vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn removed_elements_never_pop() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.insert(ExpiringElement::new(7, now));

        assert!(queue.remove(&7));
        assert!(!queue.remove(&7));
        assert!(queue.pop_expired(now + Duration::from_secs(1)).is_empty());
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn stale_slots_are_purged_before_their_deadline() {
        let far = Instant::now() + Duration::from_secs(3_600);
        let mut queue = DeadlineQueue::new();
        queue.insert(ExpiringElement::new(0, far));
        for n in 1..1_000 {
            queue.insert(ExpiringElement::new(n, far));
            assert!(queue.remove(&n));
            queue.insert(ExpiringElement::new(0, far + Duration::from_millis(n)));
        }

        assert_eq!(queue.len(), 1);
        assert!(queue.heap.len() <= COMPACT_SLACK + 2);
        assert_eq!(
            queue.next_deadline(),
            Some(far + Duration::from_millis(999))
        );
    }

    #[test]
    fn re_adding_replaces_the_deadline() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        assert!(!queue.insert(ExpiringElement::new(1, now)));
        assert!(queue.insert(ExpiringElement::new(1, now + Duration::from_secs(30))));

        assert!(queue.pop_expired(now + Duration::from_secs(1)).is_empty());
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(30)));
        assert_eq!(queue.len(), 1);
    }
}
