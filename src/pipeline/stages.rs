//! The five pipeline stages.
//!
//! ```text
//! decode (exclusive) ─┬─► persist ───────────────────────┐
//!                     ├─► aggregate-book ────────────────┤
//!                     ├─► aggregate-book_instrument ─────┼─► ack (exclusive)
//!                     └─► aggregate-book_instrument_cp ──┘
//!                               │ (multi-producer)
//!                               ▼
//!                         update ring ──► publish (exclusive)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use hdrhistogram::Histogram;

use crate::aggregation::{AggregationKey, AggregationStats, AggregationUpdate, GroupingVariant};
use crate::core::{Clock, EventRef, MultiProducer, Stage};
use crate::sink::{Acknowledger, PersistedTrade, TradeStore, UpdateSink};
use crate::trade::{TradeCodec, TradeSlot};

/// Decodes raw slot bytes into a [`TradeRecord`](crate::trade::TradeRecord).
///
/// Already-decoded slots are left alone. A codec failure marks the slot as
/// failed; downstream stages skip it.
pub struct DeserializationStage<C> {
    codec: C,
    decoded: u64,
    rejected: u64,
}

impl<C: TradeCodec> DeserializationStage<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            decoded: 0,
            rejected: 0,
        }
    }
}

impl<C: TradeCodec> Stage<TradeSlot> for DeserializationStage<C> {
    fn name(&self) -> &str {
        "decode"
    }

    fn on_event(
        &mut self,
        mut event: EventRef<'_, TradeSlot>,
        sequence: u64,
        _end_of_batch: bool,
    ) -> anyhow::Result<()> {
        let slot = event
            .get_mut()
            .context("decode stage requires exclusive slot access")?;
        if slot.is_decoded() {
            return Ok(());
        }
        match self.codec.decode(slot.raw()) {
            Ok(record) => {
                slot.set_decoded(record);
                self.decoded += 1;
            }
            Err(err) => {
                log::warn!("sequence {} failed to decode: {}", sequence, err);
                slot.mark_decode_failed();
                self.rejected += 1;
            }
        }
        Ok(())
    }

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        log::info!(
            "decode stage done: decoded={} rejected={}",
            self.decoded,
            self.rejected
        );
        Ok(())
    }
}

/// Writes every decoded trade to a [`TradeStore`].
pub struct PersistenceStage<S> {
    store: S,
    persisted: u64,
}

impl<S: TradeStore> PersistenceStage<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            persisted: 0,
        }
    }
}

impl<S: TradeStore> Stage<TradeSlot> for PersistenceStage<S> {
    fn name(&self) -> &str {
        "persist"
    }

    fn on_event(
        &mut self,
        event: EventRef<'_, TradeSlot>,
        sequence: u64,
        end_of_batch: bool,
    ) -> anyhow::Result<()> {
        let result = match event.record() {
            Some(record) => {
                let row = PersistedTrade::from_record(record);
                self.store
                    .insert(&row)
                    .with_context(|| format!("persisting sequence {sequence}"))
                    .map(|_| self.persisted += 1)
            }
            None => {
                log::debug!("persist skipping undecoded sequence {}", sequence);
                Ok(())
            }
        };
        if end_of_batch {
            // A failed insert must not hold back the rows already written.
            if let Err(err) = self.store.flush() {
                log::error!("trade store flush failed at sequence {}: {}", sequence, err);
            }
        }
        result
    }

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        self.store.flush().context("flushing trade store")?;
        log::info!("persist stage done: persisted={}", self.persisted);
        Ok(())
    }
}

/// Keeps per-key running stats for one [`GroupingVariant`] and emits a
/// snapshot onto the update ring after every applied trade.
///
/// The map is owned by the stage thread; nothing else reads it.
pub struct AggregationStage {
    name: String,
    variant: GroupingVariant,
    stats: HashMap<AggregationKey, AggregationStats>,
    clock: Arc<dyn Clock>,
    updates: MultiProducer<AggregationUpdate>,
}

impl AggregationStage {
    pub fn new(
        variant: GroupingVariant,
        clock: Arc<dyn Clock>,
        updates: MultiProducer<AggregationUpdate>,
    ) -> Self {
        Self {
            name: stage_name(variant),
            variant,
            stats: HashMap::new(),
            clock,
            updates,
        }
    }

    pub fn variant(&self) -> GroupingVariant {
        self.variant
    }

    pub fn key_count(&self) -> usize {
        self.stats.len()
    }

    pub fn stats(&self, key: &AggregationKey) -> Option<&AggregationStats> {
        self.stats.get(key)
    }
}

/// Consumer group name for an aggregation variant.
pub fn stage_name(variant: GroupingVariant) -> String {
    format!("aggregate-{}", variant.as_str().to_ascii_lowercase())
}

impl Stage<TradeSlot> for AggregationStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(
        &mut self,
        event: EventRef<'_, TradeSlot>,
        sequence: u64,
        _end_of_batch: bool,
    ) -> anyhow::Result<()> {
        let Some(record) = event.record() else {
            return Ok(());
        };
        let key = self.variant.key_for(record);
        let now = self.clock.now();
        let stats = self
            .stats
            .entry(key.clone())
            .or_insert_with(|| AggregationStats::new(now));
        let applied = stats
            .apply(record.side, record.quantity, record.price, now)
            .with_context(|| format!("aggregating sequence {sequence} into {key}"))?;
        if !applied {
            log::debug!(
                "{} sequence {} has no side; stats unchanged",
                self.name,
                sequence
            );
        }

        let snapshot = stats.clone();
        let variant = self.variant;
        self.updates
            .publish_with(|update| update.set(variant, key, snapshot))
            .context("claiming update slot")?;
        Ok(())
    }

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        log::info!("{} done: keys={}", self.name, self.stats.len());
        Ok(())
    }
}

/// Join point: clears each slot once every branch has passed it, records the
/// publish-to-ack latency and acknowledges the sequence.
pub struct AckStage<A> {
    acknowledger: A,
    clock: Arc<dyn Clock>,
    latency: Histogram<u64>,
    report: Arc<Mutex<Histogram<u64>>>,
}

impl<A: Acknowledger> AckStage<A> {
    /// `report` receives this stage's latency histogram on shutdown.
    pub fn new(
        acknowledger: A,
        clock: Arc<dyn Clock>,
        report: Arc<Mutex<Histogram<u64>>>,
    ) -> crate::core::Result<Self> {
        Ok(Self {
            acknowledger,
            clock,
            latency: Histogram::<u64>::new(3)?,
            report,
        })
    }
}

impl<A: Acknowledger> Stage<TradeSlot> for AckStage<A> {
    fn name(&self) -> &str {
        "ack"
    }

    fn on_event(
        &mut self,
        mut event: EventRef<'_, TradeSlot>,
        sequence: u64,
        _end_of_batch: bool,
    ) -> anyhow::Result<()> {
        let slot = event
            .get_mut()
            .context("ack stage requires exclusive slot access")?;
        let published_ns = slot.published_ns();
        if published_ns > 0 {
            let latency = self.clock.now().saturating_sub(published_ns);
            self.latency.saturating_record(latency);
        }
        slot.clear();
        self.acknowledger
            .ack(sequence)
            .with_context(|| format!("acknowledging sequence {sequence}"))
    }

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        report
            .add(&self.latency)
            .map_err(|err| anyhow::anyhow!("merging ack latency: {err:?}"))?;
        log::info!("ack stage done: acked={}", self.latency.len());
        Ok(())
    }
}

/// Sole consumer of the update ring.
pub struct UpdatePublishStage<U> {
    sink: U,
    published: u64,
}

impl<U: UpdateSink> UpdatePublishStage<U> {
    pub fn new(sink: U) -> Self {
        Self { sink, published: 0 }
    }
}

impl<U: UpdateSink> Stage<AggregationUpdate> for UpdatePublishStage<U> {
    fn name(&self) -> &str {
        "publish"
    }

    fn on_event(
        &mut self,
        mut event: EventRef<'_, AggregationUpdate>,
        sequence: u64,
        _end_of_batch: bool,
    ) -> anyhow::Result<()> {
        let update = event
            .get_mut()
            .context("publish stage requires exclusive slot access")?;
        let result = match (update.variant(), update.key(), update.stats()) {
            (Some(variant), Some(key), Some(stats)) => self
                .sink
                .publish(variant, key, stats)
                .with_context(|| format!("publishing update {sequence} for {key}"))
                .map(|_| self.published += 1),
            _ => {
                log::debug!("update slot {} is empty", sequence);
                Ok(())
            }
        };
        update.clear();
        result
    }

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        self.sink.flush().context("flushing update sink")?;
        log::info!("publish stage done: published={}", self.published);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Access, GroupId, ManualClock, ProducerMode, RingBuffer};
    use crate::sink::{CountingAcknowledger, MemoryTradeStore, MemoryUpdateSink};
    use crate::trade::{JsonTradeCodec, SlotState};

    fn decoded_slot(payload: &[u8]) -> TradeSlot {
        let mut slot = TradeSlot::new();
        slot.load_raw(payload, 100);
        let mut decode = DeserializationStage::new(JsonTradeCodec::new());
        decode
            .on_event(EventRef::Exclusive(&mut slot), 0, true)
            .expect("decode");
        slot
    }

    fn update_ring() -> (Arc<RingBuffer<AggregationUpdate>>, GroupId) {
        let mut builder = RingBuffer::builder(8, AggregationUpdate::new)
            .producer_mode(ProducerMode::Multi);
        let group = builder.add_group("publish", &[], Access::Exclusive);
        (builder.build().expect("update ring"), group)
    }

    #[test]
    fn test_decode_is_idempotent_and_flags_failures() {
        let mut slot = decoded_slot(br#"{"book":"B","side":"BUY","quantity":1,"price":"2","timestamp_ns":3}"#);
        assert_eq!(slot.state(), SlotState::Decoded);

        let mut decode = DeserializationStage::new(JsonTradeCodec::new());
        decode
            .on_event(EventRef::Exclusive(&mut slot), 0, true)
            .expect("decode again");
        assert_eq!(decode.decoded, 0);

        let bad = decoded_slot(b"not json");
        assert_eq!(bad.state(), SlotState::DecodeFailed);
        assert!(bad.record().is_none());
    }

    #[test]
    fn test_decode_requires_exclusive_access() {
        let slot = TradeSlot::new();
        let mut decode = DeserializationStage::new(JsonTradeCodec::new());
        assert!(decode.on_event(EventRef::Shared(&slot), 0, true).is_err());
    }

    #[test]
    fn test_persist_skips_undecoded() {
        let store = MemoryTradeStore::new();
        let mut persist = PersistenceStage::new(store.clone());
        let bad = decoded_slot(b"{");
        persist
            .on_event(EventRef::Shared(&bad), 0, false)
            .expect("skip");
        let good = decoded_slot(br#"{"book":"B","side":"sell","quantity":4,"price":"1.5","timestamp_ns":9}"#);
        persist
            .on_event(EventRef::Shared(&good), 1, true)
            .expect("persist");

        let rows = store.trades();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].side, "sell");
        assert_eq!(rows[0].trade_ts, 9);
    }

    #[test]
    fn test_aggregation_emits_snapshots() {
        let (ring, group) = update_ring();
        let clock = Arc::new(ManualClock::new(50));
        let mut stage = AggregationStage::new(
            GroupingVariant::Book,
            clock.clone(),
            ring.multi_producer().expect("producer"),
        );
        assert_eq!(stage.name(), "aggregate-book");

        let first = decoded_slot(br#"{"book":"B","side":"BUY","quantity":100,"price":"10","timestamp_ns":1}"#);
        stage
            .on_event(EventRef::Shared(&first), 0, true)
            .expect("first");
        clock.set(60);
        let second = decoded_slot(br#"{"book":"B","side":"BUY","quantity":50,"price":"12","timestamp_ns":2}"#);
        stage
            .on_event(EventRef::Shared(&second), 1, true)
            .expect("second");

        let key = AggregationKey::new(Some("B".into()), None, None);
        let stats = stage.stats(&key).expect("stats");
        assert_eq!(stats.total_buy_qty(), 150);
        assert_eq!(stats.last_updated_ns(), 60);
        assert_eq!(ring.cursor(), 1);

        // The first update still carries the stats as of the first trade.
        let sink = MemoryUpdateSink::new();
        ring.halt();
        ring.consumer(group)
            .expect("consumer")
            .run(UpdatePublishStage::new(sink.clone()));

        let updates = sink.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].stats.total_buy_qty(), 100);
        assert_eq!(updates[1].stats.total_buy_qty(), 150);
        assert_eq!(updates[1].stats.avg_buy_price().to_string(), "10.66666667");
    }

    #[test]
    fn test_unknown_side_still_emits_update() {
        let (ring, _) = update_ring();
        let mut stage = AggregationStage::new(
            GroupingVariant::BookInstrument,
            Arc::new(ManualClock::new(1)),
            ring.multi_producer().expect("producer"),
        );
        let slot = decoded_slot(br#"{"book":"B","instrument":"I","side":"HOLD","quantity":5,"price":"1","timestamp_ns":1}"#);
        stage
            .on_event(EventRef::Shared(&slot), 0, true)
            .expect("aggregate");
        assert_eq!(ring.cursor(), 0);
        assert_eq!(stage.key_count(), 1);
        let key = AggregationKey::new(Some("B".into()), Some("I".into()), None);
        assert_eq!(stage.stats(&key).map(|s| s.total_buy_qty()), Some(0));
    }

    #[test]
    fn test_ack_clears_and_acknowledges() {
        let report = Arc::new(Mutex::new(Histogram::<u64>::new(3).expect("histogram")));
        let acks = CountingAcknowledger::new();
        let mut stage = AckStage::new(
            acks.clone(),
            Arc::new(ManualClock::new(350)),
            Arc::clone(&report),
        )
        .expect("ack stage");

        let mut slot = decoded_slot(br#"{"book":"B","side":"BUY","quantity":1,"price":"1","timestamp_ns":1}"#);
        stage
            .on_event(EventRef::Exclusive(&mut slot), 4, true)
            .expect("ack");
        assert_eq!(slot.state(), SlotState::Cleared);
        assert_eq!(acks.last(), Some(4));

        stage.on_shutdown().expect("shutdown");
        let merged = report.lock().expect("lock");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.max(), 250);
    }
}
