use serde::Deserialize;
use std::time::Duration;

use crate::error::SessionError;

const MAX_BATCH_DELAY_MS: u64 = 10_000;
const MAX_CONNECT_TIMEOUT_SECS: u64 = 3_600;
const MAX_CLOSE_GRACE_MS: u64 = 60_000;

/// Tunables for the whole multiplexer. Every field has a default, so an empty
/// `[mux]` table (or none at all) yields a working configuration.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct MuxConfig {
    pub batch: BatchConfig,
    pub flow: FlowConfig,
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub close_grace_ms: CloseGrace,
}

/// Hybrid time/size flush policy for the output batcher.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    /// Hard byte ceiling; reaching it flushes immediately.
    pub max_batch_bytes: usize,
    /// Minimum spacing between two flushes of the same session.
    pub min_flush_interval_ms: u64,
    /// Minimum time a chunk waits before it is flushed.
    pub latency_floor_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 32 * 1024,
            min_flush_interval_ms: 16,
            latency_floor_ms: 4,
        }
    }
}

impl BatchConfig {
    pub fn min_flush_interval(&self) -> Duration {
        Duration::from_millis(self.min_flush_interval_ms)
    }

    pub fn latency_floor(&self) -> Duration {
        Duration::from_millis(self.latency_floor_ms)
    }
}

/// High/low-water marks for the advisory flow-control signal.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct FlowConfig {
    pub high_water_bytes: u64,
    pub low_water_bytes: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            high_water_bytes: 1024 * 1024,
            low_water_bytes: 256 * 1024,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RemoteConfig {
    /// Remote-shell client binary.
    pub program: String,
    /// Extra arguments placed before the destination.
    pub extra_args: Vec<String>,
    pub connect_timeout_secs: u64,
    /// Cap on the rolling text window used for prompt detection.
    pub detection_window_bytes: usize,
    /// Exit codes the client uses for connection-level failures.
    pub network_exit_codes: Vec<i32>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            extra_args: Vec::new(),
            connect_timeout_secs: 20,
            detection_window_bytes: 2048,
            network_exit_codes: vec![255],
        }
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct LocalConfig {
    /// Shell to spawn; falls back to `$SHELL` (or `%COMSPEC%` on Windows).
    pub shell: Option<String>,
}

impl LocalConfig {
    pub fn resolve_shell(&self) -> String {
        if let Some(shell) = &self.shell {
            return shell.clone();
        }
        if cfg!(windows) {
            std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
        } else {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        }
    }
}

/// Time a closing session waits for its process to report exit.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(transparent)]
pub struct CloseGrace(pub u64);

impl Default for CloseGrace {
    fn default() -> Self {
        Self(3_000)
    }
}

impl CloseGrace {
    pub fn duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.batch.max_batch_bytes == 0 {
            return Err(SessionError::InvalidConfig(
                "batch.max_batch_bytes must be greater than zero".to_string(),
            ));
        }
        if self.flow.low_water_bytes >= self.flow.high_water_bytes {
            return Err(SessionError::InvalidConfig(format!(
                "flow.low_water_bytes ({}) must be below flow.high_water_bytes ({})",
                self.flow.low_water_bytes, self.flow.high_water_bytes
            )));
        }
        for (name, value) in [
            ("batch.min_flush_interval_ms", self.batch.min_flush_interval_ms),
            ("batch.latency_floor_ms", self.batch.latency_floor_ms),
        ] {
            if value > MAX_BATCH_DELAY_MS {
                return Err(SessionError::InvalidConfig(format!(
                    "{name} ({value}) must not exceed {MAX_BATCH_DELAY_MS}"
                )));
            }
        }
        if self.remote.connect_timeout_secs > MAX_CONNECT_TIMEOUT_SECS {
            return Err(SessionError::InvalidConfig(format!(
                "remote.connect_timeout_secs ({}) must not exceed {MAX_CONNECT_TIMEOUT_SECS}",
                self.remote.connect_timeout_secs
            )));
        }
        if self.close_grace_ms.0 > MAX_CLOSE_GRACE_MS {
            return Err(SessionError::InvalidConfig(format!(
                "close_grace_ms ({}) must not exceed {MAX_CLOSE_GRACE_MS}",
                self.close_grace_ms.0
            )));
        }
        if self.remote.detection_window_bytes == 0 {
            return Err(SessionError::InvalidConfig(
                "remote.detection_window_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
