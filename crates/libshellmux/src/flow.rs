use crate::config::FlowConfig;

/// Edge emitted when the paused flag changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTransition {
    Paused,
    Resumed,
}

/// Per-session producer/consumer accounting with a hysteresis band.
///
/// Purely advisory: the underlying pty has no way to stop the producer, so a
/// paused session keeps flushing. Only the transitions are surfaced.
#[derive(Debug, Clone)]
pub struct FlowControl {
    queued_bytes: u64,
    paused: bool,
    high_water: u64,
    low_water: u64,
}

impl FlowControl {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            queued_bytes: 0,
            paused: false,
            high_water: config.high_water_bytes,
            low_water: config.low_water_bytes,
        }
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Account for a batch handed to the consumer.
    pub fn on_flushed(&mut self, byte_count: u64) -> Option<FlowTransition> {
        self.queued_bytes = self.queued_bytes.saturating_add(byte_count);
        if !self.paused && self.queued_bytes >= self.high_water {
            self.paused = true;
            return Some(FlowTransition::Paused);
        }
        None
    }

    /// Account for bytes the consumer reports as rendered. Clamped at zero.
    pub fn on_consumed(&mut self, byte_count: u64) -> Option<FlowTransition> {
        self.queued_bytes = self.queued_bytes.saturating_sub(byte_count);
        if self.paused && self.queued_bytes < self.low_water {
            self.paused = false;
            return Some(FlowTransition::Resumed);
        }
        None
    }
}
