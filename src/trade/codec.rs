use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trade::{Side, TradeRecord};

/// Characters reserved by the canonical aggregation key encoding.
const RESERVED: [char; 2] = [';', '='];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed trade payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid price '{0}'")]
    InvalidPrice(String),
    #[error("{field} '{value}' contains a reserved character (';' or '=')")]
    ReservedCharacter { field: &'static str, value: String },
}

/// Turns raw transport bytes into a [`TradeRecord`].
pub trait TradeCodec: Send {
    fn decode(&mut self, bytes: &[u8]) -> Result<TradeRecord, DecodeError>;
}

impl<C: TradeCodec + ?Sized> TradeCodec for Box<C> {
    fn decode(&mut self, bytes: &[u8]) -> Result<TradeRecord, DecodeError> {
        (**self).decode(bytes)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum WirePrice {
    Text(String),
    Integer(i64),
}

#[derive(Debug, Deserialize, Serialize)]
struct WireTrade {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    book: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instrument: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    counterparty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    side: Option<String>,
    quantity: i64,
    price: WirePrice,
    timestamp_ns: u64,
}

/// JSON trade codec.
///
/// ```text
/// {"book":"B1","instrument":"XYZ","counterparty":"CP","side":"buy",
///  "quantity":100,"price":"10.25","timestamp_ns":1700000000000000000}
/// ```
///
/// `price` is a decimal string or a JSON integer; floats are rejected so no
/// binary rounding sneaks in. Empty identifiers decode to absent, unknown
/// sides decode to `None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTradeCodec;

impl JsonTradeCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(record: &TradeRecord) -> Vec<u8> {
        let wire = WireTrade {
            book: record.book.clone(),
            instrument: record.instrument.clone(),
            counterparty: record.counterparty.clone(),
            side: record.side_text().map(str::to_string),
            quantity: record.quantity,
            price: WirePrice::Text(record.price.to_string()),
            timestamp_ns: record.timestamp_ns,
        };
        // A struct of strings and integers always serializes.
        serde_json::to_vec(&wire).unwrap_or_default()
    }
}

fn identifier(field: &'static str, value: Option<String>) -> Result<Option<String>, DecodeError> {
    match value {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) if value.contains(&RESERVED[..]) => {
            Err(DecodeError::ReservedCharacter { field, value })
        }
        Some(value) => Ok(Some(value)),
    }
}

impl TradeCodec for JsonTradeCodec {
    fn decode(&mut self, bytes: &[u8]) -> Result<TradeRecord, DecodeError> {
        let wire: WireTrade = serde_json::from_slice(bytes)?;
        let price = match wire.price {
            WirePrice::Text(text) => {
                Decimal::from_str(text.trim()).map_err(|_| DecodeError::InvalidPrice(text))?
            }
            WirePrice::Integer(value) => Decimal::from(value),
        };
        Ok(TradeRecord {
            book: identifier("book", wire.book)?,
            instrument: identifier("instrument", wire.instrument)?,
            counterparty: identifier("counterparty", wire.counterparty)?,
            side: wire.side.as_deref().and_then(Side::parse),
            raw_side: wire.side.filter(|side| !side.is_empty()),
            quantity: wire.quantity,
            price,
            timestamp_ns: wire.timestamp_ns,
        })
    }
}
