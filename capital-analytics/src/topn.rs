//! Bounded top-N accumulator.
//!
//! Keeps the N best `(key, value)` pairs seen so far in a min-heap, so a
//! ranking pass holds at most N entries no matter how large the population
//! is. Higher values rank first; equal values rank by canonical key string
//! ascending, which makes the result independent of arrival order.

use chrono::Utc;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::snapshot::{RankEntry, RankingSnapshot};

/// One candidate. `Greater` means ranked higher.
#[derive(Debug, Clone)]
struct Candidate<K, V> {
    value: V,
    id: String,
    key: K,
}

impl<K, V: Ord> Candidate<K, V> {
    fn rank_cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl<K, V: Ord> PartialEq for Candidate<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.rank_cmp(other) == Ordering::Equal
    }
}

impl<K, V: Ord> Eq for Candidate<K, V> {}

impl<K, V: Ord> PartialOrd for Candidate<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K, V: Ord> Ord for Candidate<K, V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank_cmp(other)
    }
}

#[derive(Debug, Clone)]
pub struct TopN<K, V> {
    capacity: usize,
    heap: BinaryHeap<Reverse<Candidate<K, V>>>,
}

impl<K, V: Ord> TopN<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            // Grows on demand; `capacity` comes from config and may be huge
            heap: BinaryHeap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Offer a candidate identified by its canonical key string `id`.
    ///
    /// Returns whether it is currently among the top N.
    pub fn offer(&mut self, key: K, id: String, value: V) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let candidate = Candidate { value, id, key };
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(candidate));
            return true;
        }
        match self.heap.peek() {
            Some(Reverse(worst)) if candidate > *worst => {
                self.heap.pop();
                self.heap.push(Reverse(candidate));
                true
            }
            _ => false,
        }
    }

    /// Entries best first, ranks starting at 1.
    pub fn into_entries(self) -> Vec<RankEntry<K, V>> {
        let mut ranked: Vec<Candidate<K, V>> =
            self.heap.into_iter().map(|Reverse(c)| c).collect();
        ranked.sort_by(|a, b| b.cmp(a));
        ranked
            .into_iter()
            .enumerate()
            .map(|(i, c)| RankEntry {
                rank: i + 1,
                key: c.key,
                value: c.value,
            })
            .collect()
    }

    /// Freeze the accumulator into a snapshot stamped now.
    pub fn into_snapshot(self) -> RankingSnapshot<K, V> {
        RankingSnapshot::new(self.into_entries(), Utc::now())
    }
}
