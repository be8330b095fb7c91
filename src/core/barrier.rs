use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::core::ring::{Access, GroupId, RingBuffer};
use crate::core::{Error, Result};

/// The read side of one consumer group: its cursor plus the barrier formed
/// by its dependencies (or the producer cursor for root groups).
pub struct Consumer<T: Send + Sync> {
    ring: Arc<RingBuffer<T>>,
    group: usize,
}

impl<T: Send + Sync> Consumer<T> {
    pub(crate) fn new(ring: Arc<RingBuffer<T>>, group: usize) -> Self {
        Self { ring, group }
    }

    pub fn group(&self) -> GroupId {
        GroupId::from_index(self.group)
    }

    pub fn name(&self) -> &str {
        &self.ring.groups[self.group].name
    }

    pub fn access(&self) -> Access {
        self.ring.groups[self.group].access
    }

    pub fn ring(&self) -> &Arc<RingBuffer<T>> {
        &self.ring
    }

    /// Last sequence this group has released.
    pub fn sequence(&self) -> i64 {
        self.ring.groups[self.group].sequence.get()
    }

    /// Blocks until `next` is readable and returns the highest readable
    /// sequence (a batch may span several sequences).
    ///
    /// Returns [`Error::Halted`] once the ring is halted and everything
    /// upstream has been drained.
    pub fn wait_for(&self, next: i64) -> Result<i64> {
        let ring = &*self.ring;
        loop {
            let available = ring.available_for(self.group, next);
            if available >= next {
                return Ok(available);
            }
            if ring.upstream_finished(self.group, next) {
                // Dependencies store their final sequence before finishing.
                let available = ring.available_for(self.group, next);
                if available >= next {
                    return Ok(available);
                }
                return Err(Error::Halted);
            }
            ring.notifier.wait(ring.wait_strategy, || {
                ring.available_for(self.group, next) >= next
                    || ring.upstream_finished(self.group, next)
            })?;
        }
    }

    /// Releases everything up to and including `sequence` to downstream
    /// groups and the producer.
    pub fn release(&self, sequence: i64) {
        self.ring.groups[self.group].sequence.set(sequence);
        self.ring.notifier.notify();
    }

    /// Marks the group as permanently done; dependents drain and stop.
    pub fn finish(&self) {
        self.ring.groups[self.group]
            .finished
            .store(true, Ordering::Release);
        self.ring.notifier.notify();
    }

    pub(crate) fn record_processed(&self) {
        self.ring.groups[self.group]
            .processed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.ring.groups[self.group]
            .failed
            .fetch_add(1, Ordering::Relaxed);
    }
}
