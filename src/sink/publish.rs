use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::aggregation::{AggregationKey, AggregationStats, GroupingVariant};
use crate::core::Result;

/// Downstream consumer of aggregation updates.
pub trait UpdateSink: Send {
    fn publish(
        &mut self,
        variant: GroupingVariant,
        key: &AggregationKey,
        stats: &AggregationStats,
    ) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: UpdateSink + ?Sized> UpdateSink for Box<S> {
    fn publish(
        &mut self,
        variant: GroupingVariant,
        key: &AggregationKey,
        stats: &AggregationStats,
    ) -> Result<()> {
        (**self).publish(variant, key, stats)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Logs every update at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUpdateSink;

impl UpdateSink for LogUpdateSink {
    fn publish(
        &mut self,
        variant: GroupingVariant,
        key: &AggregationKey,
        stats: &AggregationStats,
    ) -> Result<()> {
        log::info!("[{}] {} -> {}", variant, key, stats);
        Ok(())
    }
}

#[derive(Serialize)]
struct UpdateLine<'a> {
    variant: GroupingVariant,
    key: &'a AggregationKey,
    stats: &'a AggregationStats,
}

/// Writes one JSON object per update.
///
/// ```text
/// {"variant":"BOOK","key":"book=B1;instrument=;counterparty=","stats":{...}}
/// ```
pub struct JsonLinesUpdateSink<W: Write> {
    writer: W,
}

impl JsonLinesUpdateSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesUpdateSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> UpdateSink for JsonLinesUpdateSink<W> {
    fn publish(
        &mut self,
        variant: GroupingVariant,
        key: &AggregationKey,
        stats: &AggregationStats,
    ) -> Result<()> {
        let line = UpdateLine {
            variant,
            key,
            stats,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedUpdate {
    pub variant: GroupingVariant,
    pub key: AggregationKey,
    pub stats: AggregationStats,
}

/// Collects updates in memory. Clones share the same list.
#[derive(Clone, Default)]
pub struct MemoryUpdateSink {
    updates: Arc<Mutex<Vec<PublishedUpdate>>>,
}

impl MemoryUpdateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<PublishedUpdate> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent stats published for `key` under `variant`.
    pub fn latest(
        &self,
        variant: GroupingVariant,
        key: &AggregationKey,
    ) -> Option<AggregationStats> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|update| update.variant == variant && &update.key == key)
            .map(|update| update.stats.clone())
    }
}

impl UpdateSink for MemoryUpdateSink {
    fn publish(
        &mut self,
        variant: GroupingVariant,
        key: &AggregationKey,
        stats: &AggregationStats,
    ) -> Result<()> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedUpdate {
                variant,
                key: key.clone(),
                stats: stats.clone(),
            });
        Ok(())
    }
}
