//! Per-key fair job queue.
//!
//! One FIFO per key, served round-robin one item per turn. A key handed out
//! by [`JobQueue::pop`] is busy until [`JobQueue::complete`] releases it, so
//! two items for the same key never run at the same time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone)]
pub struct JobQueue<K, T> {
    queues: BTreeMap<K, VecDeque<T>>,
    /// Keys with queued items that are not busy, in service order.
    ready: VecDeque<K>,
    busy: BTreeSet<K>,
    len: usize,
}

impl<K: Ord + Clone, T> Default for JobQueue<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, T> JobQueue<K, T> {
    pub fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
            ready: VecDeque::new(),
            busy: BTreeSet::new(),
            len: 0,
        }
    }

    pub fn push(&mut self, key: K, item: T) {
        let queue = self.queues.entry(key.clone()).or_default();
        let was_empty = queue.is_empty();
        queue.push_back(item);
        self.len += 1;
        if was_empty && !self.busy.contains(&key) {
            self.ready.push_back(key);
        }
    }

    /// Takes the next item of the next ready key and marks the key busy.
    pub fn pop(&mut self) -> Option<(K, T)> {
        let key = self.ready.pop_front()?;
        let item = self.queues.get_mut(&key)?.pop_front()?;
        self.len -= 1;
        self.busy.insert(key.clone());
        Some((key, item))
    }

    /// Releases a busy key. Its remaining items go to the back of the line.
    pub fn complete(&mut self, key: &K) {
        if !self.busy.remove(key) {
            return;
        }
        match self.queues.get(key) {
            Some(queue) if !queue.is_empty() => self.ready.push_back(key.clone()),
            _ => {
                self.queues.remove(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_busy(&self, key: &K) -> bool {
        self.busy.contains(key)
    }
}
