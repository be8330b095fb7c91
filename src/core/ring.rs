//! Bounded circular event buffer with explicit consumer-group topology.
//!
//! A ring owns `capacity` pre-allocated slots. Producers claim the next
//! sequence, fill the slot through a [`Claim`] guard and publish it when the
//! guard drops. Consumer groups each own a cursor; a group declared with
//! dependencies only advances past a sequence once every dependency has
//! (join), groups without a path between them run concurrently (fan-out).
//!
//! ```text
//!              ┌──────────┐
//! producer ───►│  decode  │──┬──► persist ─────────┐
//!              └──────────┘  ├──► aggregate(book) ─┤
//!                            ├──► aggregate(...) ──┼──► ack
//!                            └──► aggregate(...) ──┘
//! ```
//!
//! The producer is gated on the leaf groups: slot `s` is reused only after
//! every leaf has passed `s - capacity`.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::barrier::Consumer;
use crate::core::sequence::{minimum_sequence, Sequence, INITIAL_SEQUENCE};
use crate::core::wait::{Notifier, WaitStrategy};
use crate::core::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(usize);

impl GroupId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Slot access granted to a consumer group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Read-only; may run concurrently with sibling groups.
    Shared,
    /// Mutable; the layout must order this group against every other group.
    Exclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProducerMode {
    /// One producer handle; claims never contend.
    #[default]
    Single,
    /// Cloneable producer handles claiming through compare-and-swap.
    Multi,
}

/// Point-in-time counters for one consumer group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStats {
    pub name: String,
    pub sequence: i64,
    pub processed: u64,
    pub failed: u64,
}

pub(crate) struct GroupShared {
    pub(crate) name: String,
    pub(crate) sequence: Arc<Sequence>,
    pub(crate) deps: Vec<usize>,
    pub(crate) access: Access,
    pub(crate) finished: AtomicBool,
    pub(crate) bound: AtomicBool,
    pub(crate) processed: AtomicU64,
    pub(crate) failed: AtomicU64,
}

struct GroupSpec {
    name: String,
    deps: Vec<GroupId>,
    access: Access,
}

pub struct RingBufferBuilder<T, F> {
    capacity: usize,
    factory: F,
    mode: ProducerMode,
    wait_strategy: WaitStrategy,
    groups: Vec<GroupSpec>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> RingBufferBuilder<T, F>
where
    T: Send + Sync,
    F: FnMut() -> T,
{
    pub fn producer_mode(mut self, mode: ProducerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    /// Registers a consumer group that only sees a sequence once all of
    /// `deps` have processed it. An empty `deps` reads straight off the
    /// producer cursor.
    pub fn add_group(
        &mut self,
        name: impl Into<String>,
        deps: &[GroupId],
        access: Access,
    ) -> GroupId {
        let id = GroupId(self.groups.len());
        self.groups.push(GroupSpec {
            name: name.into(),
            deps: deps.to_vec(),
            access,
        });
        id
    }

    pub fn build(mut self) -> Result<Arc<RingBuffer<T>>> {
        let capacity = self.capacity;
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity(capacity));
        }
        if self.groups.is_empty() {
            return Err(Error::InvalidLayout(
                "at least one consumer group is required".to_string(),
            ));
        }
        validate_layout(&self.groups)?;

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new((self.factory)()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let available = match self.mode {
            ProducerMode::Single => Vec::new().into_boxed_slice(),
            ProducerMode::Multi => (0..capacity)
                .map(|_| AtomicI64::new(INITIAL_SEQUENCE))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        };

        let groups: Vec<GroupShared> = self
            .groups
            .iter()
            .map(|spec| GroupShared {
                name: spec.name.clone(),
                sequence: Arc::new(Sequence::default()),
                deps: spec.deps.iter().map(|dep| dep.0).collect(),
                access: spec.access,
                finished: AtomicBool::new(false),
                bound: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            })
            .collect();

        let depended_on: HashSet<usize> = groups
            .iter()
            .flat_map(|g| g.deps.iter().copied())
            .collect();
        let gating = groups
            .iter()
            .enumerate()
            .filter(|(idx, _)| !depended_on.contains(idx))
            .map(|(_, g)| Arc::clone(&g.sequence))
            .collect::<Vec<_>>();

        log::debug!(
            "ring built: capacity={} mode={:?} groups={} leaves={}",
            capacity,
            self.mode,
            groups.len(),
            gating.len()
        );

        Ok(Arc::new(RingBuffer {
            slots,
            mask: (capacity - 1) as i64,
            index_shift: capacity.trailing_zeros(),
            capacity: capacity as i64,
            mode: self.mode,
            claim: Sequence::default(),
            cursor: Sequence::default(),
            available,
            gating,
            groups,
            notifier: Notifier::new(),
            wait_strategy: self.wait_strategy,
            halted: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            producer_taken: AtomicBool::new(false),
        }))
    }
}

/// Rejects forward/unknown dependencies and exclusive groups that could run
/// alongside another group.
fn validate_layout(groups: &[GroupSpec]) -> Result<()> {
    let mut ancestors: Vec<HashSet<usize>> = Vec::with_capacity(groups.len());
    for (idx, spec) in groups.iter().enumerate() {
        let mut set = HashSet::new();
        for dep in &spec.deps {
            if dep.0 >= idx {
                return Err(Error::InvalidLayout(format!(
                    "group '{}' depends on unknown group #{}",
                    spec.name, dep.0
                )));
            }
            set.insert(dep.0);
            set.extend(ancestors[dep.0].iter().copied());
        }
        ancestors.push(set);
    }

    for (idx, spec) in groups.iter().enumerate() {
        if spec.access != Access::Exclusive {
            continue;
        }
        for other in 0..groups.len() {
            if other == idx {
                continue;
            }
            let ordered = ancestors[idx].contains(&other) || ancestors[other].contains(&idx);
            if !ordered {
                return Err(Error::InvalidLayout(format!(
                    "exclusive group '{}' may run concurrently with '{}'",
                    spec.name, groups[other].name
                )));
            }
        }
    }
    Ok(())
}

pub struct RingBuffer<T> {
    slots: Box<[UnsafeCell<T>]>,
    mask: i64,
    index_shift: u32,
    capacity: i64,
    mode: ProducerMode,
    /// Highest claimed sequence.
    claim: Sequence,
    /// Highest published sequence (single-producer mode).
    cursor: Sequence,
    /// Lap number last published into each slot (multi-producer mode).
    available: Box<[AtomicI64]>,
    gating: Vec<Arc<Sequence>>,
    pub(crate) groups: Vec<GroupShared>,
    pub(crate) notifier: Notifier,
    pub(crate) wait_strategy: WaitStrategy,
    halted: AtomicBool,
    /// Claims taken but not yet published. Root consumers only finish once
    /// this drops to zero after the halt.
    in_flight: AtomicUsize,
    producer_taken: AtomicBool,
}

// SAFETY: slot access is coordinated through sequences. A slot is written by
// exactly one producer between claim and publish, mutated only by an
// exclusive group (validated at build), and otherwise shared read-only.
unsafe impl<T: Send + Sync> Sync for RingBuffer<T> {}

impl<T: Send + Sync> RingBuffer<T> {
    pub fn builder<F: FnMut() -> T>(capacity: usize, factory: F) -> RingBufferBuilder<T, F> {
        RingBufferBuilder {
            capacity,
            factory,
            mode: ProducerMode::Single,
            wait_strategy: WaitStrategy::default(),
            groups: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn producer_mode(&self) -> ProducerMode {
        self.mode
    }

    /// Takes the single producer handle. Fails in multi-producer mode or
    /// when the handle was already taken.
    pub fn producer(self: &Arc<Self>) -> Result<Producer<T>> {
        if self.mode != ProducerMode::Single {
            return Err(Error::InvalidLayout(
                "ring is configured for multiple producers".to_string(),
            ));
        }
        if self.producer_taken.swap(true, Ordering::AcqRel) {
            return Err(Error::ProducerTaken);
        }
        Ok(Producer {
            ring: Arc::clone(self),
        })
    }

    pub fn multi_producer(self: &Arc<Self>) -> Result<MultiProducer<T>> {
        if self.mode != ProducerMode::Multi {
            return Err(Error::InvalidLayout(
                "ring is configured for a single producer".to_string(),
            ));
        }
        Ok(MultiProducer {
            ring: Arc::clone(self),
        })
    }

    /// Binds the consumer side of `group`. Each group is bound at most once.
    pub fn consumer(self: &Arc<Self>, group: GroupId) -> Result<Consumer<T>> {
        let shared = self
            .groups
            .get(group.0)
            .ok_or_else(|| Error::InvalidLayout(format!("unknown group #{}", group.0)))?;
        if shared.bound.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidLayout(format!(
                "group '{}' already has a consumer",
                shared.name
            )));
        }
        Ok(Consumer::new(Arc::clone(self), group.0))
    }

    /// Cooperative shutdown signal. Blocked producers fail with
    /// [`Error::Halted`]; consumers drain what is published and stop.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.notifier.notify();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Highest sequence visible to root consumers.
    pub fn cursor(&self) -> i64 {
        match self.mode {
            ProducerMode::Single => self.cursor.get(),
            ProducerMode::Multi => {
                let consumed = minimum_sequence(&self.gating, self.claim.get());
                self.published_upper(consumed + 1)
            }
        }
    }

    /// Number of slots the producer may claim without blocking.
    pub fn remaining_capacity(&self) -> i64 {
        let consumed = minimum_sequence(&self.gating, self.claim.get());
        self.capacity - (self.claim.get() - consumed)
    }

    pub fn group_stats(&self, group: GroupId) -> Option<GroupStats> {
        self.groups.get(group.0).map(|g| GroupStats {
            name: g.name.clone(),
            sequence: g.sequence.get(),
            processed: g.processed.load(Ordering::Relaxed),
            failed: g.failed.load(Ordering::Relaxed),
        })
    }

    pub fn all_group_stats(&self) -> Vec<GroupStats> {
        (0..self.groups.len())
            .filter_map(|idx| self.group_stats(GroupId(idx)))
            .collect()
    }

    /// Registers the claim before checking the halt flag. A root consumer
    /// that observed the halt therefore either sees this claim in flight and
    /// waits for its publish, or this claim observes the halt and fails.
    fn claim_next(&self) -> Result<i64> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let claimed = self.try_claim();
        if claimed.is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.notifier.notify();
        }
        claimed
    }

    fn try_claim(&self) -> Result<i64> {
        loop {
            if self.is_halted() {
                return Err(Error::Halted);
            }
            let current = self.claim.get();
            let next = current + 1;
            let wrap_point = next - self.capacity;
            if wrap_point > minimum_sequence(&self.gating, current) {
                self.notifier.wait(self.wait_strategy, || {
                    self.is_halted() || wrap_point <= minimum_sequence(&self.gating, current)
                })?;
                continue;
            }
            match self.mode {
                ProducerMode::Single => {
                    self.claim.set(next);
                    return Ok(next);
                }
                ProducerMode::Multi => {
                    if self.claim.compare_and_set(current, next) {
                        return Ok(next);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn publish(&self, sequence: i64) {
        match self.mode {
            ProducerMode::Single => self.cursor.set(sequence),
            ProducerMode::Multi => {
                let idx = (sequence & self.mask) as usize;
                self.available[idx].store(sequence >> self.index_shift, Ordering::Release);
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.notifier.notify();
    }

    #[inline]
    fn is_available(&self, sequence: i64) -> bool {
        let idx = (sequence & self.mask) as usize;
        self.available[idx].load(Ordering::Acquire) == sequence >> self.index_shift
    }

    /// Highest contiguous published sequence, scanning from `lower`.
    ///
    /// `lower` must not be older than one lap behind the claim cursor; slots
    /// before that may already carry a later lap.
    pub(crate) fn published_upper(&self, lower: i64) -> i64 {
        match self.mode {
            ProducerMode::Single => self.cursor.get(),
            ProducerMode::Multi => {
                let upper = self.claim.get();
                let mut seq = lower.max(0);
                while seq <= upper {
                    if !self.is_available(seq) {
                        return seq - 1;
                    }
                    seq += 1;
                }
                upper
            }
        }
    }

    /// Sequence `group` may read up to when it is looking for `next`.
    pub(crate) fn available_for(&self, group: usize, next: i64) -> i64 {
        let deps = &self.groups[group].deps;
        if deps.is_empty() {
            return self.published_upper(next);
        }
        deps.iter()
            .map(|dep| self.groups[*dep].sequence.get())
            .min()
            .unwrap_or(INITIAL_SEQUENCE)
    }

    /// True once nothing beyond what is already visible can become
    /// available to `group`, which is looking for `next`.
    pub(crate) fn upstream_finished(&self, group: usize, next: i64) -> bool {
        let deps = &self.groups[group].deps;
        if deps.is_empty() {
            // Claims in flight at halt time still publish; wait for them.
            return self.is_halted()
                && self.in_flight.load(Ordering::SeqCst) == 0
                && self.published_upper(next) >= self.claim.get();
        }
        deps.iter()
            .all(|dep| self.groups[*dep].finished.load(Ordering::Acquire))
    }

    /// # Safety
    /// The caller must hold read access to `sequence` per the group layout.
    pub(crate) unsafe fn slot(&self, sequence: i64) -> &T {
        &*self.slots[(sequence & self.mask) as usize].get()
    }

    /// # Safety
    /// The caller must hold exclusive access to `sequence`: a producer between
    /// claim and publish, or an exclusive group.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot_mut(&self, sequence: i64) -> &mut T {
        &mut *self.slots[(sequence & self.mask) as usize].get()
    }
}

/// A claimed slot. Publishes the sequence when dropped.
pub struct Claim<'a, T: Send + Sync> {
    ring: &'a RingBuffer<T>,
    sequence: i64,
}

impl<T: Send + Sync> Claim<'_, T> {
    pub fn sequence(&self) -> u64 {
        self.sequence as u64
    }
}

impl<T: Send + Sync> std::ops::Deref for Claim<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the claimed sequence is exclusively owned until publish.
        unsafe { self.ring.slot(self.sequence) }
    }
}

impl<T: Send + Sync> std::ops::DerefMut for Claim<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the claimed sequence is exclusively owned until publish.
        unsafe { self.ring.slot_mut(self.sequence) }
    }
}

impl<T: Send + Sync> Drop for Claim<'_, T> {
    fn drop(&mut self) {
        self.ring.publish(self.sequence);
    }
}

/// The one producer of a single-producer ring.
pub struct Producer<T: Send + Sync> {
    ring: Arc<RingBuffer<T>>,
}

impl<T: Send + Sync> Producer<T> {
    /// Claims the next slot, blocking while the ring is full.
    pub fn claim(&mut self) -> Result<Claim<'_, T>> {
        let sequence = self.ring.claim_next()?;
        Ok(Claim {
            ring: &self.ring,
            sequence,
        })
    }

    /// Claims, fills and publishes one slot. Returns its sequence.
    pub fn publish_with(&mut self, fill: impl FnOnce(&mut T)) -> Result<u64> {
        let mut claim = self.claim()?;
        fill(&mut claim);
        Ok(claim.sequence())
    }

    pub fn ring(&self) -> &Arc<RingBuffer<T>> {
        &self.ring
    }
}

/// A producer handle for multi-producer rings. Clone one per writer thread.
pub struct MultiProducer<T: Send + Sync> {
    ring: Arc<RingBuffer<T>>,
}

impl<T: Send + Sync> Clone for MultiProducer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: Send + Sync> MultiProducer<T> {
    pub fn claim(&mut self) -> Result<Claim<'_, T>> {
        let sequence = self.ring.claim_next()?;
        Ok(Claim {
            ring: &self.ring,
            sequence,
        })
    }

    pub fn publish_with(&mut self, fill: impl FnOnce(&mut T)) -> Result<u64> {
        let mut claim = self.claim()?;
        fill(&mut claim);
        Ok(claim.sequence())
    }

    pub fn ring(&self) -> &Arc<RingBuffer<T>> {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(groups: &[(&str, Vec<usize>, Access)]) -> Result<Arc<RingBuffer<u64>>> {
        let mut builder = RingBuffer::builder(8, || 0u64);
        let mut ids = Vec::new();
        for (name, deps, access) in groups {
            let deps: Vec<GroupId> = deps.iter().map(|d| ids[*d]).collect();
            ids.push(builder.add_group(*name, &deps, *access));
        }
        builder.build()
    }

    #[test]
    fn test_capacity_must_be_power_of_two() {
        let mut builder = RingBuffer::builder(12, || 0u64);
        builder.add_group("only", &[], Access::Shared);
        assert!(matches!(builder.build(), Err(Error::InvalidCapacity(12))));

        let mut builder = RingBuffer::builder(0, || 0u64);
        builder.add_group("only", &[], Access::Shared);
        assert!(matches!(builder.build(), Err(Error::InvalidCapacity(0))));
    }

    #[test]
    fn test_requires_a_group() {
        let builder = RingBuffer::builder(8, || 0u64);
        assert!(matches!(builder.build(), Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut builder = RingBuffer::builder(8, || 0u64);
        builder.add_group("a", &[GroupId(3)], Access::Shared);
        let err = builder.build().err().expect("layout error");
        assert!(err.to_string().contains("unknown group"));
    }

    #[test]
    fn test_exclusive_sibling_rejected() {
        let err = ring_with(&[
            ("decode", vec![], Access::Exclusive),
            ("persist", vec![0], Access::Shared),
            ("clear", vec![0], Access::Exclusive),
        ])
        .err()
        .expect("layout error");
        assert!(err.to_string().contains("'clear'"));
    }

    #[test]
    fn test_diamond_layout_accepted() {
        let ring = ring_with(&[
            ("decode", vec![], Access::Exclusive),
            ("left", vec![0], Access::Shared),
            ("right", vec![0], Access::Shared),
            ("join", vec![1, 2], Access::Exclusive),
        ])
        .expect("diamond");
        // Only the join gates the producer.
        assert_eq!(ring.gating.len(), 1);
        assert_eq!(ring.remaining_capacity(), 8);
    }

    #[test]
    fn test_single_producer_taken_once() {
        let ring = ring_with(&[("a", vec![], Access::Shared)]).expect("ring");
        let _producer = ring.producer().expect("first");
        assert!(matches!(ring.producer(), Err(Error::ProducerTaken)));
        assert!(ring.multi_producer().is_err());
    }

    #[test]
    fn test_claim_publishes_on_drop() {
        let ring = ring_with(&[("a", vec![], Access::Shared)]).expect("ring");
        let mut producer = ring.producer().expect("producer");
        assert_eq!(ring.cursor(), INITIAL_SEQUENCE);
        {
            let mut claim = producer.claim().expect("claim");
            *claim = 42;
            assert_eq!(claim.sequence(), 0);
        }
        assert_eq!(ring.cursor(), 0);
        let seq = producer.publish_with(|slot| *slot = 43).expect("publish");
        assert_eq!(seq, 1);
        assert_eq!(ring.cursor(), 1);
        assert_eq!(ring.remaining_capacity(), 6);
    }

    #[test]
    fn test_multi_producer_contiguous_availability() {
        let mut builder = RingBuffer::builder(8, || 0u64).producer_mode(ProducerMode::Multi);
        builder.add_group("a", &[], Access::Shared);
        let ring = builder.build().expect("ring");
        let mut p1 = ring.multi_producer().expect("p1");
        let mut p2 = p1.clone();

        let first = p1.claim().expect("claim 0");
        let second_seq = p2.publish_with(|slot| *slot = 2).expect("claim 1");
        assert_eq!(second_seq, 1);
        // Sequence 1 is published but 0 is still in flight.
        assert_eq!(ring.published_upper(0), INITIAL_SEQUENCE);
        drop(first);
        assert_eq!(ring.published_upper(0), 1);
    }

    #[test]
    fn test_halt_fails_claims() {
        let ring = ring_with(&[("a", vec![], Access::Shared)]).expect("ring");
        let mut producer = ring.producer().expect("producer");
        ring.halt();
        assert!(matches!(producer.claim(), Err(Error::Halted)));
        assert!(ring.upstream_finished(0, 0));
    }

    #[test]
    fn test_root_group_waits_for_claim_taken_before_halt() {
        let ring = ring_with(&[("a", vec![], Access::Shared)]).expect("ring");
        let mut producer = ring.producer().expect("producer");

        let mut claim = producer.claim().expect("claim");
        *claim = 9;
        ring.halt();
        assert!(!ring.upstream_finished(0, 0));

        drop(claim);
        assert_eq!(ring.available_for(0, 0), 0);
        assert!(ring.upstream_finished(0, 1));
    }
}
