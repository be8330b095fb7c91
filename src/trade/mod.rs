//! Trade records and the ring slot that carries them through the pipeline.

pub mod codec;
pub mod slot;

use std::fmt;

use rust_decimal::Decimal;

pub use codec::{DecodeError, JsonTradeCodec, TradeCodec};
pub use slot::{SlotState, TradeSlot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Case-insensitive match against exactly `BUY` / `SELL`. Anything else
    /// (numeric codes, padding, other words) is not a side.
    pub fn parse(raw: &str) -> Option<Side> {
        if raw.eq_ignore_ascii_case("BUY") {
            Some(Side::Buy)
        } else if raw.eq_ignore_ascii_case("SELL") {
            Some(Side::Sell)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded trade. Immutable once it lands in a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TradeRecord {
    pub book: Option<String>,
    pub instrument: Option<String>,
    pub counterparty: Option<String>,
    pub side: Option<Side>,
    /// Side as it arrived on the wire, kept for storage even when it is not
    /// a recognised side.
    pub raw_side: Option<String>,
    pub quantity: i64,
    pub price: Decimal,
    pub timestamp_ns: u64,
}

impl TradeRecord {
    /// Side text for storage: the wire text when present, else the
    /// canonical side.
    pub fn side_text(&self) -> Option<&str> {
        self.raw_side
            .as_deref()
            .or_else(|| self.side.map(Side::as_str))
    }
}
