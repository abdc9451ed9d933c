//! A binary min-heap over `(key, priority)` pairs that also tracks each
//! key's current heap position, so a priority can be updated or a key
//! removed in `O(log n)` without a linear scan.
//!
//! Both the TTL cache (C1, keyed by eviction instant) and the block store
//! (C4, keyed by a block's sliding eviction deadline) need exactly this
//! shape — spec.md's data model calls out the same "index equals heap
//! position" invariant independently for `Cache Entry` and `Block` — so it
//! lives here once rather than being duplicated per component.

use std::collections::HashMap;
use std::hash::Hash;

/// A min-heap keyed by `K`, ordered by `P`, with O(1) position lookup.
#[derive(Debug, Default)]
pub struct IndexedHeap<K, P> {
    nodes: Vec<(K, P)>,
    positions: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone, P: Ord + Copy> IndexedHeap<K, P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// Returns the lowest-priority `(key, priority)` pair without removing
    /// it.
    pub fn peek(&self) -> Option<(&K, &P)> {
        self.nodes.first().map(|(k, p)| (k, p))
    }

    /// Inserts a new key, or updates the priority of an existing one,
    /// restoring the heap property either way.
    pub fn upsert(&mut self, key: K, priority: P) {
        if let Some(&idx) = self.positions.get(&key) {
            let old = self.nodes[idx].1;
            self.nodes[idx].1 = priority;
            if priority < old {
                self.sift_up(idx);
            } else if priority > old {
                self.sift_down(idx);
            }
            return;
        }

        let idx = self.nodes.len();
        self.positions.insert(key.clone(), idx);
        self.nodes.push((key, priority));
        self.sift_up(idx);
    }

    /// Removes and returns the lowest-priority pair.
    pub fn pop(&mut self) -> Option<(K, P)> {
        if self.nodes.is_empty() {
            return None;
        }
        let last = self.nodes.len() - 1;
        self.nodes.swap(0, last);
        let (key, priority) = self.nodes.pop().expect("checked non-empty above");
        self.positions.remove(&key);
        if !self.nodes.is_empty() {
            self.positions.insert(self.nodes[0].0.clone(), 0);
            self.sift_down(0);
        }
        Some((key, priority))
    }

    /// Removes an arbitrary key from the heap, wherever it currently sits.
    pub fn remove(&mut self, key: &K) -> Option<P> {
        let idx = self.positions.remove(key)?;
        let last = self.nodes.len() - 1;
        self.nodes.swap(idx, last);
        let (_, priority) = self.nodes.pop().expect("idx was valid");

        if idx < self.nodes.len() {
            self.positions.insert(self.nodes[idx].0.clone(), idx);
            self.sift_down(idx);
            self.sift_up(idx);
        }
        Some(priority)
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.nodes[idx].1 < self.nodes[parent].1 {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;

            if left < self.nodes.len() && self.nodes[left].1 < self.nodes[smallest].1 {
                smallest = left;
            }
            if right < self.nodes.len() && self.nodes[right].1 < self.nodes[smallest].1 {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.nodes.swap(a, b);
        self.positions.insert(self.nodes[a].0.clone(), a);
        self.positions.insert(self.nodes[b].0.clone(), b);
    }

    /// Asserts the heap-order and position-map invariants; used by tests
    /// and by property tests exercising spec.md §8's quantified
    /// invariants.
    #[cfg(test)]
    fn check_invariants(&self) {
        for (idx, (key, _)) in self.nodes.iter().enumerate() {
            assert_eq!(self.positions.get(key), Some(&idx));
        }
        for idx in 1..self.nodes.len() {
            let parent = (idx - 1) / 2;
            assert!(self.nodes[parent].1 <= self.nodes[idx].1);
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Upsert(u16, i32),
        Pop,
        Remove(u16),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u16..16, any::<i32>()).prop_map(|(k, p)| Op::Upsert(k, p)),
            Just(Op::Pop),
            (0u16..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        /// Heap-order and position-map invariants hold after any sequence
        /// of upserts, pops and removes -- the two structures (`nodes` and
        /// `positions`) must never drift apart regardless of operation
        /// order (spec.md §8's "index equals heap position" invariant).
        #[test]
        fn invariants_hold_after_arbitrary_ops(ops in prop::collection::vec(op_strategy(), 0..200)) {
            let mut heap: IndexedHeap<u16, i32> = IndexedHeap::new();
            for op in ops {
                match op {
                    Op::Upsert(k, p) => heap.upsert(k, p),
                    Op::Pop => { heap.pop(); }
                    Op::Remove(k) => { heap.remove(&k); }
                }
                heap.check_invariants();
            }
        }

        /// Popping the whole heap always yields priorities in
        /// non-decreasing order, independent of insertion order.
        #[test]
        fn pop_order_is_non_decreasing(priorities in prop::collection::vec(any::<i32>(), 0..200)) {
            let mut heap: IndexedHeap<usize, i32> = IndexedHeap::new();
            for (idx, priority) in priorities.iter().enumerate() {
                heap.upsert(idx, *priority);
            }
            let mut last: Option<i32> = None;
            while let Some((_, priority)) = heap.pop() {
                if let Some(prev) = last {
                    prop_assert!(prev <= priority);
                }
                last = Some(priority);
            }
        }
    }
}
