//! # Nonce Deduplication
//!
//! A bounded FIFO set of recently seen RainTree nonces (or any small `Copy`
//! key, such as a `(nonce, level)` pair). Inserting past
//! capacity evicts the oldest nonce. Each entry also counts how many copies
//! of that nonce arrived, which feeds the per-block redundancy metric.
//!
//! All operations are O(1) amortized under a single `parking_lot::Mutex`;
//! the check and the insert happen under one lock acquisition so two streams
//! carrying the same nonce cannot both be treated as first.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

/// Result of observing a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First time this nonce is seen (within the retention window).
    New,
    /// Already seen; `copies` includes this one.
    Duplicate {
        /// Total copies received so far.
        copies: u32,
    },
}

impl Observation {
    /// True for [`Observation::New`].
    pub fn is_new(&self) -> bool {
        matches!(self, Observation::New)
    }
}

#[derive(Debug)]
struct Inner<K> {
    counts: HashMap<K, u32>,
    order: VecDeque<K>,
    /// Keys whose copy count changed since the last drain. Always a
    /// subset of `counts`.
    dirty: HashSet<K>,
}

impl<K> Default for Inner<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            order: VecDeque::new(),
            dirty: HashSet::new(),
        }
    }
}

/// Thread-safe bounded set of keys with per-key copy counts.
#[derive(Debug)]
pub struct Deduper<K> {
    capacity: usize,
    inner: Mutex<Inner<K>>,
}

/// The RainTree nonce set.
pub type NonceDeduper = Deduper<u64>;

impl<K: Copy + Eq + Hash + Ord> Deduper<K> {
    /// Deduper retaining at most `capacity` keys (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Records one copy of `nonce` and reports whether it was new.
    pub fn observe(&self, nonce: K) -> Observation {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.counts.get_mut(&nonce) {
            *count = count.saturating_add(1);
            let copies = *count;
            inner.dirty.insert(nonce);
            return Observation::Duplicate { copies };
        }

        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.counts.remove(&oldest);
                inner.dirty.remove(&oldest);
            }
        }
        inner.order.push_back(nonce);
        inner.counts.insert(nonce, 1);
        inner.dirty.insert(nonce);
        Observation::New
    }

    /// Inserts `nonce`; returns `true` if it was not already present.
    pub fn push(&self, nonce: K) -> bool {
        self.observe(nonce).is_new()
    }

    /// True if `nonce` is currently retained.
    pub fn contains(&self, nonce: K) -> bool {
        self.inner.lock().counts.contains_key(&nonce)
    }

    /// Number of retained nonces.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// True when no nonce is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy counts of every nonce first seen or duplicated since the last
    /// drain. Evicted nonces are skipped.
    pub fn drain_copy_counts(&self) -> Vec<(K, u32)> {
        let mut inner = self.inner.lock();
        let dirty = std::mem::take(&mut inner.dirty);
        let mut counts: Vec<(K, u32)> = dirty
            .into_iter()
            .filter_map(|nonce| inner.counts.get(&nonce).map(|count| (nonce, *count)))
            .collect();
        counts.sort_unstable();
        counts
    }
}

impl<K: Copy + Eq + Hash + Ord> Default for Deduper<K> {
    fn default() -> Self {
        Self::new(crate::config::MAX_NONCES)
    }
}
