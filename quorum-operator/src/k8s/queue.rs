//! The work queue of cluster reconciliation passes.
//!
//! A key is held at most once in the queue and is handed out to at most one worker at a time.
//! A key added while its pass is in flight is marked dirty and queued again once the pass is
//! done, so that changes observed mid-pass are never lost.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// A deduplicating FIFO queue of keys with in-flight tracking.
#[derive(Debug)]
pub struct WorkQueue<K> {
    /// Keys waiting to be handed out, in order.
    queue: VecDeque<K>,
    /// The set of keys in `queue`.
    queued: HashSet<K>,
    /// Keys handed out and not yet done.
    in_flight: HashSet<K>,
    /// In-flight keys which were added again while in flight.
    dirty: HashSet<K>,
}

impl<K> Default for WorkQueue<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    /// Add the given key, returning `true` if it was newly queued.
    pub fn add(&mut self, key: K) -> bool {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Hand out the next queued key, marking it as in flight.
    pub fn next(&mut self) -> Option<K> {
        let key = self.queue.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Mark the pass of the given key as done, queueing it again if it was added meanwhile.
    pub fn done(&mut self, key: &K) {
        self.in_flight.remove(key);
        if self.dirty.remove(key) {
            self.add(key.clone());
        }
    }

    /// Drop any pending work for the given key. An in-flight pass still needs to be marked done.
    pub fn forget(&mut self, key: &K) {
        if self.queued.remove(key) {
            self.queue.retain(|queued| queued != key);
        }
        self.dirty.remove(key);
    }

    /// Check if a pass for the given key is in flight.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains(key)
    }

    /// The number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
