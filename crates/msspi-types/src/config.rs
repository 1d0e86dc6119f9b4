//! Session and transport configuration.
//!
//! Loaded from a TOML file such as:
//!
//! ```toml
//! [handshake]
//! timeout_retries = 0
//! backoff_ms = 1
//! max_backoff_ms = 50
//!
//! [transport]
//! connect_timeout_ms = 5000
//! read_timeout_ms = 30000
//! ```
//!
//! Every key is optional; missing keys take the [`Default`] values.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MsspiError, Result};

/// Extra handshake steps attempted after the transport reports a timeout.
const DEFAULT_TIMEOUT_RETRIES: u32 = 0;

/// First pause after an idle handshake step (milliseconds).
const DEFAULT_BACKOFF_MS: u64 = 1;

/// Ceiling for the idle backoff (milliseconds).
const DEFAULT_MAX_BACKOFF_MS: u64 = 50;

/// TCP connect timeout (milliseconds).
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MsspiConfig {
    pub handshake: HandshakeConfig,
    pub transport: TransportConfig,
}

/// Controls how a session drives the engine's handshake steps.
///
/// Deadlines belong to the transport. A step that ends with a recorded
/// transport timeout is retried at most `timeout_retries` times; a step that
/// is merely idle sleeps and is retried without limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub timeout_retries: u32,
    /// Sleep after the first idle step in milliseconds.
    pub backoff_ms: u64,
    /// Idle sleeps double up to this many milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_retries: DEFAULT_TIMEOUT_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl HandshakeConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Sleep to use after `current` when the next step is idle too.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff())
    }
}

/// Deadlines applied to TCP transports. `0` disables a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }
}

impl MsspiConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        if config.handshake.max_backoff_ms < config.handshake.backoff_ms {
            return Err(MsspiError::Config(
                "handshake.max_backoff_ms is below handshake.backoff_ms".to_string(),
            ));
        }
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}
