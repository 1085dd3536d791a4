//! Bridge configuration
//!
//! Tunes the dispatch loop. The engine's own bootstrap file is passed
//! through verbatim and is not described here.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound on `pollTimeoutMs`, which is also the stop latency
pub const MAX_POLL_TIMEOUT_MS: u64 = 60_000;

/// What happens to retrieved-but-undelivered events when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopPolicy {
    /// Deliver the rest of the current batch before exiting
    #[default]
    Drain,
    /// Record the rest of the batch as skipped
    Skip,
}

/// Dispatch loop and bookkeeping settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Bounded wait for the first event of each iteration, in milliseconds
    ///
    /// Also the worst-case latency for observing a stop request.
    pub poll_timeout_ms: u64,

    /// Maximum events retrieved per iteration
    pub max_batch: usize,

    /// Policy for undelivered events on stop
    pub stop_policy: StopPolicy,

    /// Skipped-event records kept in memory (0 = unbounded)
    pub skipped_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 50,
            max_batch: 64,
            stop_policy: StopPolicy::Drain,
            skipped_capacity: 10_000,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file
    ///
    /// Missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), ?config, "Bridge config loaded");
        Ok(config)
    }

    /// Parse and validate configuration from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_batch == 0 {
            return Err(BridgeError::Config("maxBatch must be at least 1".to_string()));
        }
        if self.poll_timeout_ms > MAX_POLL_TIMEOUT_MS {
            return Err(BridgeError::Config(format!(
                "pollTimeoutMs must be at most {}, got {}",
                MAX_POLL_TIMEOUT_MS, self.poll_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}
