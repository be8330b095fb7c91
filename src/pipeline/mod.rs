//! Trade pipeline wiring and lifecycle.
//!
//! Two rings: the primary trade ring (single producer, six stage threads)
//! and the update ring fed by the three aggregation stages and drained by
//! one publish thread. Shutdown halts the primary ring first so every
//! update produced while draining still reaches the sink.

pub mod config;
pub mod stages;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use hdrhistogram::Histogram;

use crate::aggregation::{AggregationUpdate, GroupingVariant};
use crate::core::{Access, Clock, Error, GroupStats, Producer, ProducerMode, Result, RingBuffer};
use crate::sink::{Acknowledger, TradeStore, UpdateSink};
use crate::trade::{TradeCodec, TradeSlot};

pub use config::{ClockKind, PipelineConfig};
pub use stages::{
    stage_name, AckStage, AggregationStage, DeserializationStage, PersistenceStage,
    UpdatePublishStage,
};

/// Feeds raw trade payloads into the primary ring.
pub struct TradePublisher {
    producer: Producer<TradeSlot>,
    clock: Arc<dyn Clock>,
}

impl TradePublisher {
    /// Copies `bytes` into the next slot, blocking while the ring is full.
    /// Returns the assigned sequence.
    pub fn publish(&mut self, bytes: &[u8]) -> Result<u64> {
        let now = self.clock.now();
        self.producer.publish_with(|slot| slot.load_raw(bytes, now))
    }

    pub fn remaining_capacity(&self) -> i64 {
        self.producer.ring().remaining_capacity()
    }
}

/// Percentiles of publish-to-ack latency in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: u64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

impl LatencySummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        Self {
            count: histogram.len(),
            p50_ns: histogram.value_at_quantile(0.50),
            p99_ns: histogram.value_at_quantile(0.99),
            max_ns: histogram.max(),
        }
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} p50={}ns p99={}ns max={}ns",
            self.count, self.p50_ns, self.p99_ns, self.max_ns
        )
    }
}

/// Final counters returned by [`TradePipeline::shutdown`].
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Sequences published on the primary ring.
    pub published: u64,
    /// Primary ring groups followed by the update publish group.
    pub stages: Vec<GroupStats>,
    pub ack_latency: LatencySummary,
}

impl PipelineReport {
    pub fn stage(&self, name: &str) -> Option<&GroupStats> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

pub struct TradePipeline {
    trades: Arc<RingBuffer<TradeSlot>>,
    updates: Arc<RingBuffer<AggregationUpdate>>,
    publisher: Option<TradePublisher>,
    trade_threads: Vec<(String, JoinHandle<()>)>,
    update_threads: Vec<(String, JoinHandle<()>)>,
    latency: Arc<Mutex<Histogram<u64>>>,
    stopped: bool,
}

impl TradePipeline {
    /// Builds both rings and starts every stage thread: the publish stage
    /// first, then decode, persist, the aggregations and ack.
    pub fn start<C, S, U, A>(
        config: PipelineConfig,
        codec: C,
        store: S,
        update_sink: U,
        acknowledger: A,
    ) -> Result<Self>
    where
        C: TradeCodec + 'static,
        S: TradeStore + 'static,
        U: UpdateSink + 'static,
        A: Acknowledger + 'static,
    {
        config.validate()?;
        let clock = config.clock.build();

        let mut builder = RingBuffer::builder(config.update_capacity, AggregationUpdate::new)
            .producer_mode(ProducerMode::Multi)
            .wait_strategy(config.wait_strategy);
        let publish_group = builder.add_group("publish", &[], Access::Exclusive);
        let updates = builder.build()?;

        let mut builder = RingBuffer::builder(config.ring_capacity, TradeSlot::new)
            .wait_strategy(config.wait_strategy);
        let decode_group = builder.add_group("decode", &[], Access::Exclusive);
        let persist_group = builder.add_group("persist", &[decode_group], Access::Shared);
        let aggregate_groups = GroupingVariant::ALL.map(|variant| {
            let group = builder.add_group(stage_name(variant), &[decode_group], Access::Shared);
            (variant, group)
        });
        let mut join = vec![persist_group];
        join.extend(aggregate_groups.iter().map(|(_, group)| *group));
        let ack_group = builder.add_group("ack", &join, Access::Exclusive);
        let trades = builder.build()?;

        let publisher = TradePublisher {
            producer: trades.producer()?,
            clock: Arc::clone(&clock),
        };
        let latency = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));

        let mut pipeline = TradePipeline {
            trades: Arc::clone(&trades),
            updates: Arc::clone(&updates),
            publisher: Some(publisher),
            trade_threads: Vec::new(),
            update_threads: Vec::new(),
            latency: Arc::clone(&latency),
            stopped: false,
        };

        // A failed spawn drops `pipeline`, which halts and joins whatever
        // already started.
        let mut core_index = 0;
        let mut next_core = || {
            let core = config.core_for(core_index);
            core_index += 1;
            core
        };

        let handle = updates
            .consumer(publish_group)?
            .spawn(UpdatePublishStage::new(update_sink), next_core())?;
        pipeline.update_threads.push(("publish".to_string(), handle));

        let handle = trades
            .consumer(decode_group)?
            .spawn(DeserializationStage::new(codec), next_core())?;
        pipeline.trade_threads.push(("decode".to_string(), handle));

        let handle = trades
            .consumer(persist_group)?
            .spawn(PersistenceStage::new(store), next_core())?;
        pipeline.trade_threads.push(("persist".to_string(), handle));

        for (variant, group) in aggregate_groups {
            let stage =
                AggregationStage::new(variant, Arc::clone(&clock), updates.multi_producer()?);
            let handle = trades.consumer(group)?.spawn(stage, next_core())?;
            pipeline.trade_threads.push((stage_name(variant), handle));
        }

        let stage = AckStage::new(acknowledger, Arc::clone(&clock), latency)?;
        let handle = trades.consumer(ack_group)?.spawn(stage, next_core())?;
        pipeline.trade_threads.push(("ack".to_string(), handle));

        log::info!(
            "trade pipeline started: ring_capacity={} update_capacity={} threads={}",
            config.ring_capacity,
            config.update_capacity,
            pipeline.trade_threads.len() + pipeline.update_threads.len()
        );
        Ok(pipeline)
    }

    /// Takes the trade publisher. Only one exists per pipeline.
    pub fn publisher(&mut self) -> Result<TradePublisher> {
        self.publisher.take().ok_or(Error::ProducerTaken)
    }

    /// Live counters for every consumer group.
    pub fn stage_stats(&self) -> Vec<GroupStats> {
        let mut stats = self.trades.all_group_stats();
        stats.extend(self.updates.all_group_stats());
        stats
    }

    /// Stops accepting trades, drains both rings and joins every thread.
    pub fn shutdown(mut self) -> Result<PipelineReport> {
        self.stop()?;

        let published = (self.trades.cursor() + 1).max(0) as u64;
        let latency = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        let report = PipelineReport {
            published,
            stages: self.stage_stats(),
            ack_latency: LatencySummary::from_histogram(&latency),
        };
        log::info!(
            "trade pipeline stopped: published={} ack latency {}",
            report.published,
            report.ack_latency
        );
        Ok(report)
    }

    fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        self.trades.halt();
        let primary = join_all(&mut self.trade_threads);
        // Aggregation stages have stopped producing; drain what they left.
        self.updates.halt();
        let secondary = join_all(&mut self.update_threads);
        primary.and(secondary)
    }
}

fn join_all(threads: &mut Vec<(String, JoinHandle<()>)>) -> Result<()> {
    let mut failed = Vec::new();
    for (name, handle) in threads.drain(..) {
        if handle.join().is_err() {
            log::error!("stage thread {} panicked", name);
            failed.push(name);
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(Error::Stage(failed.join(", ")))
    }
}

impl Drop for TradePipeline {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("trade pipeline shutdown failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CountingAcknowledger, MemoryTradeStore, MemoryUpdateSink};
    use crate::trade::JsonTradeCodec;

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            ring_capacity: 16,
            update_capacity: 8,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_start_and_shutdown_idle() {
        let mut pipeline = TradePipeline::start(
            small_config(),
            JsonTradeCodec::new(),
            MemoryTradeStore::new(),
            MemoryUpdateSink::new(),
            CountingAcknowledger::new(),
        )
        .unwrap();
        let _publisher = pipeline.publisher().unwrap();
        assert!(matches!(pipeline.publisher(), Err(Error::ProducerTaken)));

        let report = pipeline.shutdown().unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(report.stages.len(), 7);
        assert_eq!(report.ack_latency, LatencySummary::default());
        assert!(report.stage("aggregate-book_instrument_counterparty").is_some());
        assert!(report.stage("publish").is_some());
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let config = PipelineConfig {
            ring_capacity: 10,
            ..PipelineConfig::default()
        };
        let result = TradePipeline::start(
            config,
            JsonTradeCodec::new(),
            MemoryTradeStore::new(),
            MemoryUpdateSink::new(),
            CountingAcknowledger::new(),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_publisher_fails_after_shutdown() {
        let mut pipeline = TradePipeline::start(
            small_config(),
            JsonTradeCodec::new(),
            MemoryTradeStore::new(),
            MemoryUpdateSink::new(),
            CountingAcknowledger::new(),
        )
        .unwrap();
        let mut publisher = pipeline.publisher().unwrap();
        publisher
            .publish(br#"{"book":"B","side":"BUY","quantity":1,"price":"1","timestamp_ns":1}"#)
            .unwrap();
        let report = pipeline.shutdown().unwrap();
        assert_eq!(report.published, 1);
        assert!(matches!(publisher.publish(b"{}"), Err(Error::Halted)));
    }
}
