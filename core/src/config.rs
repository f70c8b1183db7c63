//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Settings fixed at engine construction.
///
/// Timeouts are cumulative budgets: the connect budget covers everything up
/// to the last request byte being written, the read budget everything after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Verify TLS peers against the bundled root store.
    pub verify_certificate: bool,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verify_certificate: false,
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    pub fn new(verify_certificate: bool, connect_timeout_ms: u64, read_timeout_ms: u64) -> Self {
        Self {
            verify_certificate,
            connect_timeout_ms,
            read_timeout_ms,
        }
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        serde_json::from_str(raw).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }

    pub fn with_verify_certificate(mut self, verify: bool) -> Self {
        self.verify_certificate = verify;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
