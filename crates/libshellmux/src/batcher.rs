use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use shellmux_protocol::{Event, SessionId};

use crate::config::{BatchConfig, FlowConfig};
use crate::flow::{FlowControl, FlowTransition};
use crate::sink::SinkHandle;

/// Per-session output accumulator with a hybrid time/size flush policy.
///
/// The batcher never owns a timer task. It exposes the instant at which the
/// next flush is due through [`OutputBatcher::deadline`] and the owning
/// session task sleeps on it, so cancelling the timer and flushing are the
/// same state change.
pub struct OutputBatcher {
    session_id: SessionId,
    sink: SinkHandle,
    config: BatchConfig,
    flow: FlowControl,
    pending: Vec<Vec<u8>>,
    pending_bytes: usize,
    flush_at: Option<Instant>,
    last_flush: Option<Instant>,
    /// Trailing bytes of a multi-byte character split across flushes.
    carry: Vec<u8>,
}

impl OutputBatcher {
    pub fn new(
        session_id: SessionId,
        sink: SinkHandle,
        config: BatchConfig,
        flow: FlowConfig,
    ) -> Self {
        Self {
            session_id,
            sink,
            config,
            flow: FlowControl::new(flow),
            pending: Vec::new(),
            pending_bytes: 0,
            flush_at: None,
            last_flush: None,
            carry: Vec::new(),
        }
    }

    /// When the scheduled flush is due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn accumulate(&mut self, bytes: &[u8], now: Instant) {
        if bytes.is_empty() {
            return;
        }
        self.pending.push(bytes.to_vec());
        self.pending_bytes += bytes.len();

        if self.pending_bytes >= self.config.max_batch_bytes {
            self.flush_at = None;
            self.flush(now);
            return;
        }

        if self.flush_at.is_none() {
            self.flush_at = Some(now + self.flush_delay(now));
        }
    }

    /// `max(min_interval - since_last_flush, 0, latency_floor)`
    fn flush_delay(&self, now: Instant) -> Duration {
        let interval_left = match self.last_flush {
            Some(last) => self
                .config
                .min_flush_interval()
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        };
        interval_left.max(self.config.latency_floor())
    }

    /// Deliver everything pending as one `session_output` event.
    pub fn flush(&mut self, now: Instant) {
        self.flush_at = None;
        if self.pending.is_empty() {
            return;
        }
        let mut bytes = std::mem::take(&mut self.carry);
        for chunk in self.pending.drain(..) {
            bytes.extend_from_slice(&chunk);
        }
        self.pending_bytes = 0;
        self.last_flush = Some(now);

        let tail = incomplete_tail_len(&bytes);
        self.carry = bytes.split_off(bytes.len() - tail);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        self.deliver(text);
    }

    /// Cancel any scheduled flush and emit whatever is left, including a
    /// dangling partial character.
    pub fn teardown(&mut self, now: Instant) {
        self.flush(now);
        if !self.carry.is_empty() {
            let text = String::from_utf8_lossy(&self.carry).into_owned();
            self.carry.clear();
            self.deliver(text);
        }
    }

    pub fn acknowledge(&mut self, byte_count: u64) {
        if self.flow.on_consumed(byte_count) == Some(FlowTransition::Resumed) {
            debug!(
                session_id = %self.session_id,
                queued_bytes = self.flow.queued_bytes(),
                "output flow resumed"
            );
        }
    }

    fn deliver(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        let byte_count = text.len() as u64;
        let event = Event::SessionOutput {
            session_id: self.session_id.clone(),
            text,
        };
        if let Err(e) = self.sink.deliver(event) {
            debug!(session_id = %self.session_id, byte_count, "dropping output batch: {e}");
            return;
        }
        if self.flow.on_flushed(byte_count) == Some(FlowTransition::Paused) {
            warn!(
                session_id = %self.session_id,
                queued_bytes = self.flow.queued_bytes(),
                "consumer is falling behind, output flow paused"
            );
        }
    }
}

/// Length of an unfinished UTF-8 sequence at the end of `bytes`, or zero.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if width > back { back } else { 0 };
    }
    0
}
