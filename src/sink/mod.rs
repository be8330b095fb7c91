//! External collaborators of the pipeline: trade store, update sink and
//! acknowledger.

pub mod ack;
pub mod publish;
pub mod store;

pub use ack::{Acknowledger, CountingAcknowledger, NoopAcknowledger};
pub use publish::{
    JsonLinesUpdateSink, LogUpdateSink, MemoryUpdateSink, PublishedUpdate, UpdateSink,
};
pub use store::{CsvTradeStore, MemoryTradeStore, NullTradeStore, PersistedTrade, TradeStore};
