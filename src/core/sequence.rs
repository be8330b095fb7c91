use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Sequence value meaning "nothing claimed / consumed yet".
pub const INITIAL_SEQUENCE: i64 = -1;

/// A cache-line padded sequence counter.
///
/// Every producer cursor and consumer group cursor is one of these. The
/// alignment keeps cursors owned by different threads off the same line.
#[repr(C, align(128))]
#[derive(Debug)]
pub struct Sequence {
    value: AtomicI64,
}

impl Sequence {
    pub fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn compare_and_set(&self, current: i64, new: i64) -> bool {
        self.value
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_SEQUENCE)
    }
}

/// Smallest value across `sequences`, or `fallback` when the slice is empty.
pub fn minimum_sequence(sequences: &[Arc<Sequence>], fallback: i64) -> i64 {
    sequences
        .iter()
        .map(|seq| seq.get())
        .min()
        .unwrap_or(fallback)
}
