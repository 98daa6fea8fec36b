//! Priority Queue for pending timers
//!
//! Uses std::collections::BinaryHeap keyed by (deadline, tie, id) with a
//! HashMap holding the entries, so an entry can be reached by id for
//! cancellation without touching the heap. Ties are broken by the insertion
//! sequence, which keeps equal deadlines in FIFO order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Key for the priority queue heap.
#[derive(Clone, Copy, Debug)]
struct Key {
    deadline: f64,
    tie: u64,
    id: u64,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so the ordering is reversed for min-heap behavior.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .total_cmp(&other.deadline)
            .then(self.tie.cmp(&other.tie))
            .then(self.id.cmp(&other.id))
            .reverse()
    }
}

struct Slot<M> {
    deadline: f64,
    tie: u64,
    meta: M,
}

/// A min-priority queue of entries addressed by id.
///
/// Entries are never re-keyed in place: rescheduling means popping and
/// adding again under a fresh tie.
pub struct MinPq<M> {
    heap: BinaryHeap<Key>,
    live: HashMap<u64, Slot<M>>,
}

impl<M> Default for MinPq<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MinPq<M> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    /// Add an entry. Returns false if the id is already queued.
    pub fn add(&mut self, id: u64, deadline: f64, tie: u64, meta: M) -> bool {
        if self.live.contains_key(&id) {
            return false;
        }
        self.live.insert(id, Slot { deadline, tie, meta });
        self.heap.push(Key { deadline, tie, id });
        true
    }

    /// Mutable access to a queued entry.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut M> {
        self.live.get_mut(&id).map(|slot| &mut slot.meta)
    }

    /// Deadline and tie of the minimum entry.
    pub fn peek(&self) -> Option<(f64, u64)> {
        self.heap.peek().map(|k| (k.deadline, k.tie))
    }

    pub fn peek_deadline(&self) -> Option<f64> {
        self.peek().map(|(deadline, _)| deadline)
    }

    /// Pop the minimum entry. Returns (id, deadline, metadata).
    pub fn pop(&mut self) -> Option<(u64, f64, M)> {
        while let Some(k) = self.heap.pop() {
            let Some(slot) = self.live.remove(&k.id) else {
                continue;
            };
            debug_assert_eq!(slot.tie, k.tie);
            return Some((k.id, slot.deadline, slot.meta));
        }
        None
    }

    /// Iterate over queued entries in no particular order.
    pub fn values(&self) -> impl Iterator<Item = &M> {
        self.live.values().map(|slot| &slot.meta)
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_deadline_order() {
        let mut pq: MinPq<&str> = MinPq::new();

        assert!(pq.add(1, 0.3, 0, "third"));
        assert!(pq.add(2, 0.1, 1, "first"));
        assert!(pq.add(3, 0.2, 2, "second"));

        let order: Vec<_> = std::iter::from_fn(|| pq.pop().map(|(_, _, m)| m)).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
        assert!(pq.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut pq: MinPq<i32> = MinPq::new();
        assert!(pq.add(7, 1.0, 0, 1));
        assert!(!pq.add(7, 0.5, 1, 2));
        assert_eq!(pq.len(), 1);
        assert_eq!(pq.peek_deadline(), Some(1.0));
    }

    #[test]
    fn test_tie_breaking_is_fifo() {
        let mut pq: MinPq<u32> = MinPq::new();

        pq.add(10, 0.5, 2, 100);
        pq.add(11, 0.5, 0, 200);
        pq.add(12, 0.5, 1, 300);

        let (id, _, _) = pq.pop().unwrap();
        assert_eq!(id, 11);
        let (id, _, _) = pq.pop().unwrap();
        assert_eq!(id, 12);
        let (id, _, _) = pq.pop().unwrap();
        assert_eq!(id, 10);
    }

    #[test]
    fn test_get_mut_and_readd() {
        let mut pq: MinPq<bool> = MinPq::new();
        pq.add(1, 0.2, 0, true);
        pq.add(2, 0.4, 1, true);

        if let Some(active) = pq.get_mut(1) {
            *active = false;
        }
        assert_eq!(pq.values().filter(|a| **a).count(), 1);

        let (id, dl, active) = pq.pop().unwrap();
        assert_eq!((id, active), (1, false));
        assert!((dl - 0.2).abs() < 1e-10);

        // Same id may be queued again once popped.
        assert!(pq.add(1, 0.6, 2, true));
        assert_eq!(pq.peek(), Some((0.4, 1)));
    }
}
