//! Staged ring-buffer pipeline for trade persistence and online aggregation.
//!
//! Raw trade payloads enter a bounded ring, are decoded once, then fan out
//! to a persistence stage and three aggregation stages (one per
//! [`GroupingVariant`]) before a join stage acknowledges them. Aggregation
//! stages emit stats snapshots onto a second, multi-producer ring drained
//! by a publish stage.

pub mod aggregation;
pub mod core;
pub mod pipeline;
pub mod sink;
pub mod trade;

pub use aggregation::{AggregationKey, AggregationStats, AggregationUpdate, GroupingVariant};
pub use crate::core::{Error, Result};
pub use pipeline::{PipelineConfig, PipelineReport, TradePipeline, TradePublisher};
pub use trade::{JsonTradeCodec, Side, TradeCodec, TradeRecord};
