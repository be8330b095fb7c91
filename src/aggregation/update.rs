use crate::aggregation::{AggregationKey, AggregationStats, GroupingVariant};

/// Slot of the update ring: one key's stats as of the trade that changed it.
///
/// The stats are a snapshot taken by the aggregation stage, so later trades
/// on the same key never alter an update already in flight.
#[derive(Debug, Default, Clone)]
pub struct AggregationUpdate {
    variant: Option<GroupingVariant>,
    key: Option<AggregationKey>,
    stats: Option<AggregationStats>,
}

impl AggregationUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        variant: GroupingVariant,
        key: AggregationKey,
        stats: AggregationStats,
    ) {
        self.variant = Some(variant);
        self.key = Some(key);
        self.stats = Some(stats);
    }

    pub fn clear(&mut self) {
        self.variant = None;
        self.key = None;
        self.stats = None;
    }

    pub fn variant(&self) -> Option<GroupingVariant> {
        self.variant
    }

    pub fn key(&self) -> Option<&AggregationKey> {
        self.key.as_ref()
    }

    pub fn stats(&self) -> Option<&AggregationStats> {
        self.stats.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none() || self.stats.is_none()
    }
}
