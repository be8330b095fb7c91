//! Aggregation keys and their canonical string form.
//!
//! ```text
//! book=<value-or-empty>;instrument=<value-or-empty>;counterparty=<value-or-empty>
//! ```
//!
//! Fields are always emitted in this order. An absent field renders as an
//! empty value and an empty value parses back to absent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trade::TradeRecord;

const FIELDS: [&str; 3] = ["book", "instrument", "counterparty"];

/// Which record fields make up the aggregation key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupingVariant {
    Book,
    BookInstrument,
    BookInstrumentCounterparty,
}

impl GroupingVariant {
    pub const ALL: [GroupingVariant; 3] = [
        GroupingVariant::Book,
        GroupingVariant::BookInstrument,
        GroupingVariant::BookInstrumentCounterparty,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GroupingVariant::Book => "BOOK",
            GroupingVariant::BookInstrument => "BOOK_INSTRUMENT",
            GroupingVariant::BookInstrumentCounterparty => "BOOK_INSTRUMENT_COUNTERPARTY",
        }
    }

    /// Builds the key for `record`; fields outside the variant are absent.
    pub fn key_for(self, record: &TradeRecord) -> AggregationKey {
        let book = record.book.clone();
        match self {
            GroupingVariant::Book => AggregationKey::new(book, None, None),
            GroupingVariant::BookInstrument => {
                AggregationKey::new(book, record.instrument.clone(), None)
            }
            GroupingVariant::BookInstrumentCounterparty => AggregationKey::new(
                book,
                record.instrument.clone(),
                record.counterparty.clone(),
            ),
        }
    }
}

impl fmt::Display for GroupingVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("aggregation key string is empty")]
    Empty,
    #[error("expected 3 ';'-separated segments, found {0}")]
    SegmentCount(usize),
    #[error("segment '{0}' must contain exactly one '='")]
    MalformedSegment(String),
    #[error("unknown key field '{0}'")]
    UnknownField(String),
    #[error("expected field '{expected}' but found '{found}'")]
    OutOfOrder {
        expected: &'static str,
        found: String,
    },
}

/// Immutable (book, instrument, counterparty) tuple.
///
/// Absent fields are `None`, never an empty string; equality and hashing are
/// structural.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    book: Option<String>,
    instrument: Option<String>,
    counterparty: Option<String>,
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl AggregationKey {
    pub fn new(
        book: Option<String>,
        instrument: Option<String>,
        counterparty: Option<String>,
    ) -> Self {
        Self {
            book: present(book),
            instrument: present(instrument),
            counterparty: present(counterparty),
        }
    }

    pub fn generate(record: &TradeRecord, variant: GroupingVariant) -> Self {
        variant.key_for(record)
    }

    pub fn book(&self) -> Option<&str> {
        self.book.as_deref()
    }

    pub fn instrument(&self) -> Option<&str> {
        self.instrument.as_deref()
    }

    pub fn counterparty(&self) -> Option<&str> {
        self.counterparty.as_deref()
    }

    pub fn parse(s: &str) -> Result<Self, KeyParseError> {
        s.parse()
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "book={};instrument={};counterparty={}",
            self.book().unwrap_or(""),
            self.instrument().unwrap_or(""),
            self.counterparty().unwrap_or("")
        )
    }
}

impl FromStr for AggregationKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(KeyParseError::Empty);
        }
        let segments: Vec<&str> = s.split(';').collect();
        if segments.len() != FIELDS.len() {
            return Err(KeyParseError::SegmentCount(segments.len()));
        }

        let mut values: [Option<String>; 3] = [None, None, None];
        for (idx, segment) in segments.iter().enumerate() {
            if segment.matches('=').count() != 1 {
                return Err(KeyParseError::MalformedSegment(segment.to_string()));
            }
            let (name, value) = segment
                .split_once('=')
                .ok_or_else(|| KeyParseError::MalformedSegment(segment.to_string()))?;
            if !FIELDS.contains(&name) {
                return Err(KeyParseError::UnknownField(name.to_string()));
            }
            if name != FIELDS[idx] {
                return Err(KeyParseError::OutOfOrder {
                    expected: FIELDS[idx],
                    found: name.to_string(),
                });
            }
            values[idx] = Some(value.to_string());
        }

        let [book, instrument, counterparty] = values;
        Ok(AggregationKey::new(book, instrument, counterparty))
    }
}

impl Serialize for AggregationKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AggregationKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
