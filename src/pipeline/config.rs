//! Pipeline configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! overrides.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{Clock, Error, QuantaClock, Result, SystemClock, WaitStrategy};

/// Timestamp source for stats updates and ack latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockKind {
    #[default]
    System,
    Quanta,
}

impl ClockKind {
    pub fn build(self) -> Arc<dyn Clock> {
        match self {
            ClockKind::System => Arc::new(SystemClock),
            ClockKind::Quanta => Arc::new(QuantaClock::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Slots in the primary trade ring. Power of two.
    /// Default: 1024
    pub ring_capacity: usize,

    /// Slots in the aggregation update ring. Power of two.
    /// Default: 256
    pub update_capacity: usize,

    /// How blocked producers and stages wait.
    /// Default: spin 10us, then park
    pub wait_strategy: WaitStrategy,

    pub clock: ClockKind,

    /// Core ids handed to stage threads in start order (publish, decode,
    /// persist, the three aggregations, ack). Missing entries run unpinned.
    pub cpu_affinity: Vec<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            update_capacity: 256,
            wait_strategy: WaitStrategy::default(),
            clock: ClockKind::default(),
            cpu_affinity: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::debug!("loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, capacity) in [
            ("ring_capacity", self.ring_capacity),
            ("update_capacity", self.update_capacity),
        ] {
            if capacity == 0 || !capacity.is_power_of_two() {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be a non-zero power of two, got {capacity}"
                )));
            }
        }
        if let WaitStrategy::Sleep(duration) = self.wait_strategy {
            if duration.is_zero() {
                return Err(Error::InvalidConfig(
                    "sleep wait strategy needs a non-zero duration".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Core for the `index`-th stage thread, if configured.
    pub fn core_for(&self, index: usize) -> Option<core_affinity::CoreId> {
        self.cpu_affinity
            .get(index)
            .map(|&id| core_affinity::CoreId { id })
    }
}
