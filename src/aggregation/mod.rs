//! Keyed running statistics over trades.

pub mod key;
pub mod stats;
pub mod update;

pub use key::{AggregationKey, GroupingVariant, KeyParseError};
pub use stats::{AggregationError, AggregationStats, AVERAGE_SCALE};
pub use update::AggregationUpdate;
