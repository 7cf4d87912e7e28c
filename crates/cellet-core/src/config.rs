//! Nucleus configuration
//!
//! Tunables consumed by the heartbeat machine, the ack timers and connection
//! bookkeeping. Every field has a default so partial config files load.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{TalkError, TalkResult};
use crate::frame::{DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_SIZE};

// ----------------------------------------------------------------------------
// Device Class
// ----------------------------------------------------------------------------

/// Kind of device hosting the nucleus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Phone,
    Tablet,
    Desktop,
    #[default]
    Server,
}

// ----------------------------------------------------------------------------
// Nucleus Configuration
// ----------------------------------------------------------------------------

/// Configuration for a nucleus and its kernels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NucleusConfig {
    /// Device class tag reported by this process
    pub device: DeviceClass,
    /// Working directory for the process
    pub work_path: PathBuf,
    /// Heartbeat interval in milliseconds
    pub heartbeat_ms: u64,
    /// Default time to wait for an ack before `on_speak_timeout`
    pub ack_timeout_ms: u64,
    /// Time allowed for a TCP connect and handshake to complete
    pub connect_timeout_ms: u64,
    /// Upper bound on draining queued bytes during a graceful hangup
    pub hangup_drain_ms: u64,
    /// Largest accepted frame body
    pub max_frame_len: u32,
    /// Delay before the resilience layer re-calls a lost speaker; `None` disables
    pub reconnect_interval_ms: Option<u64>,
}

impl Default for NucleusConfig {
    fn default() -> Self {
        Self {
            device: DeviceClass::default(),
            work_path: PathBuf::from("."),
            heartbeat_ms: 60_000,
            ack_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            hangup_drain_ms: 3_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            reconnect_interval_ms: Some(10_000),
        }
    }
}

impl NucleusConfig {
    /// Short timings for tests
    pub fn testing() -> Self {
        Self {
            heartbeat_ms: 5_000,
            ack_timeout_ms: 1_000,
            connect_timeout_ms: 1_000,
            hangup_drain_ms: 200,
            reconnect_interval_ms: Some(100),
            ..Self::default()
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// How often liveness is inspected; a quarter interval keeps closure
    /// within `2.25 x heartbeat`
    pub fn heartbeat_tick(&self) -> Duration {
        Duration::from_millis((self.heartbeat_ms / 4).max(1))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn hangup_drain(&self) -> Duration {
        Duration::from_millis(self.hangup_drain_ms)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        self.reconnect_interval_ms.map(Duration::from_millis)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> TalkResult<()> {
        if self.heartbeat_ms == 0 {
            return Err(TalkError::config_error("heartbeat_ms must be positive"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(TalkError::config_error("ack_timeout_ms must be positive"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(TalkError::config_error("connect_timeout_ms must be positive"));
        }
        if (self.max_frame_len as usize) < FRAME_HEADER_SIZE * 8 {
            return Err(TalkError::config_error(format!(
                "max_frame_len {} is too small",
                self.max_frame_len
            )));
        }
        if self.reconnect_interval_ms == Some(0) {
            return Err(TalkError::config_error(
                "reconnect_interval_ms must be positive when set",
            ));
        }
        Ok(())
    }
}
