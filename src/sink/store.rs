use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::core::Result;
use crate::trade::TradeRecord;

/// Row written for every decoded trade. Absent fields are empty strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PersistedTrade {
    pub trade_ts: u64,
    pub book: String,
    pub instrument: String,
    pub counterparty: String,
    pub side: String,
    pub price: String,
    pub quantity: i64,
}

impl PersistedTrade {
    pub fn from_record(record: &TradeRecord) -> Self {
        Self {
            trade_ts: record.timestamp_ns,
            book: record.book.clone().unwrap_or_default(),
            instrument: record.instrument.clone().unwrap_or_default(),
            counterparty: record.counterparty.clone().unwrap_or_default(),
            side: record.side_text().unwrap_or_default().to_string(),
            price: record.price.to_string(),
            quantity: record.quantity,
        }
    }
}

/// Destination for persisted trades.
pub trait TradeStore: Send {
    fn insert(&mut self, trade: &PersistedTrade) -> Result<()>;

    /// Flush any buffered rows.
    fn flush(&mut self) -> Result<()>;
}

impl<S: TradeStore + ?Sized> TradeStore for Box<S> {
    fn insert(&mut self, trade: &PersistedTrade) -> Result<()> {
        (**self).insert(trade)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Append trades to CSV with a
/// `trade_ts,book,instrument,counterparty,side,price,quantity` header.
pub struct CsvTradeStore<W: Write = File> {
    writer: csv::Writer<W>,
}

impl CsvTradeStore<File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> CsvTradeStore<W> {
    pub fn new(inner: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(true)
            .from_writer(inner);
        Self { writer }
    }
}

impl<W: Write + Send> TradeStore for CsvTradeStore<W> {
    fn insert(&mut self, trade: &PersistedTrade) -> Result<()> {
        self.writer.serialize(trade)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Store that keeps every row in memory. Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryTradeStore {
    rows: Arc<Mutex<Vec<PersistedTrade>>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trades(&self) -> Vec<PersistedTrade> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TradeStore for MemoryTradeStore {
    fn insert(&mut self, trade: &PersistedTrade) -> Result<()> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trade.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Store that drops all rows (for benchmarking).
pub struct NullTradeStore;

impl TradeStore for NullTradeStore {
    fn insert(&mut self, _trade: &PersistedTrade) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
