//! Bridge-layer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout configuration for a session's bridge pair.
///
/// A value of zero disables the corresponding timeout; a disabled read
/// timeout means a blocked `read` waits indefinitely for data, close, or
/// failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Milliseconds a blocked `read` may wait for data. 0 disables.
    #[serde(default)]
    pub read_timeout_millis: u64,

    /// Milliseconds a blocked `write` or `flush` may wait for the
    /// transport to drain. 0 disables.
    #[serde(default)]
    pub write_timeout_millis: u64,
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_timeout_millis(mut self, millis: u64) -> Self {
        self.read_timeout_millis = millis;
        self
    }

    pub fn with_write_timeout_millis(mut self, millis: u64) -> Self {
        self.write_timeout_millis = millis;
        self
    }

    /// Read timeout as a duration, `None` when disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_millis > 0).then(|| Duration::from_millis(self.read_timeout_millis))
    }

    /// Write timeout as a duration, `None` when disabled.
    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_millis > 0).then(|| Duration::from_millis(self.write_timeout_millis))
    }
}
