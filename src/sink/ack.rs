use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::{Result, INITIAL_SEQUENCE};

/// Acknowledges a fully processed primary-ring sequence back to the source.
pub trait Acknowledger: Send {
    fn ack(&mut self, sequence: u64) -> Result<()>;
}

impl<A: Acknowledger + ?Sized> Acknowledger for Box<A> {
    fn ack(&mut self, sequence: u64) -> Result<()> {
        (**self).ack(sequence)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAcknowledger;

impl Acknowledger for NoopAcknowledger {
    fn ack(&mut self, _sequence: u64) -> Result<()> {
        Ok(())
    }
}

/// Counts acks and remembers the last acknowledged sequence. Clones share
/// the counters.
#[derive(Debug, Clone)]
pub struct CountingAcknowledger {
    count: Arc<AtomicU64>,
    last: Arc<AtomicI64>,
}

impl Default for CountingAcknowledger {
    fn default() -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
            last: Arc::new(AtomicI64::new(INITIAL_SEQUENCE)),
        }
    }
}

impl CountingAcknowledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Last acknowledged sequence, `None` before the first ack.
    pub fn last(&self) -> Option<u64> {
        let last = self.last.load(Ordering::Acquire);
        (last >= 0).then_some(last as u64)
    }
}

impl Acknowledger for CountingAcknowledger {
    fn ack(&mut self, sequence: u64) -> Result<()> {
        self.last.store(sequence as i64, Ordering::Release);
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
