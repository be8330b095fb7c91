use crate::trade::TradeRecord;

/// Lifecycle of a [`TradeSlot`] within one lap of the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Never written.
    #[default]
    Empty,
    /// Raw bytes published, not decoded yet.
    RawOnly,
    Decoded,
    /// Codec rejected the bytes; downstream stages skip the slot.
    DecodeFailed,
    /// Released by the last stage; ready for the producer's next lap.
    Cleared,
}

/// Ring cell payload for the primary trade ring.
///
/// Pre-allocated once and reused for the life of the process. The raw
/// buffer keeps its capacity across laps.
#[derive(Debug, Default)]
pub struct TradeSlot {
    raw: Vec<u8>,
    record: Option<TradeRecord>,
    state: SlotState,
    published_ns: u64,
}

impl TradeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side: copy `bytes` in and reset the decoded view.
    pub fn load_raw(&mut self, bytes: &[u8], published_ns: u64) {
        if !matches!(self.state, SlotState::Empty | SlotState::Cleared) {
            log::debug!("overwriting slot still in state {:?}", self.state);
        }
        self.raw.clear();
        self.raw.extend_from_slice(bytes);
        self.record = None;
        self.state = SlotState::RawOnly;
        self.published_ns = published_ns;
    }

    pub fn set_decoded(&mut self, record: TradeRecord) {
        self.record = Some(record);
        self.state = SlotState::Decoded;
    }

    pub fn mark_decode_failed(&mut self) {
        self.record = None;
        self.state = SlotState::DecodeFailed;
    }

    /// Drops the record reference so a reused slot cannot leak it.
    pub fn clear(&mut self) {
        self.raw.clear();
        self.record = None;
        self.state = SlotState::Cleared;
        self.published_ns = 0;
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn record(&self) -> Option<&TradeRecord> {
        self.record.as_ref()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn published_ns(&self) -> u64 {
        self.published_ns
    }

    pub fn is_decoded(&self) -> bool {
        self.state == SlotState::Decoded && self.record.is_some()
    }
}
