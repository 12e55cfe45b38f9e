//! Bounded event inbox.
//!
//! Uses `crossbeam-queue::ArrayQueue` so transport, Hosting and timer tasks
//! can deliver events from any thread. A full inbox rejects the event with
//! [`RaError::InboxFull`] instead of growing.

use crossbeam_queue::ArrayQueue;

use crate::agent::RaEvent;
use crate::error::{RaError, Result};
use crate::instrumentation::METRICS;

#[derive(Debug)]
pub struct Inbox {
    inner: ArrayQueue<RaEvent>,
}

impl Inbox {
    /// Creates an inbox holding at most `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "inbox capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    pub fn push(&self, event: RaEvent) -> Result<()> {
        self.inner.push(event).map_err(|_| {
            METRICS.increment_inbox_rejected();
            RaError::InboxFull {
                capacity: self.inner.capacity(),
            }
        })
    }

    /// Pops up to `max` events.
    pub fn drain(&self, max: usize) -> Vec<RaEvent> {
        let mut batch = Vec::with_capacity(max.min(self.inner.len()));
        while batch.len() < max {
            match self.inner.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}
