//! Replication tuning parameters
//!
//! Stored as JSON. A missing file means defaults.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Settings shared by every agent of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Bytes copied per `write_content` call
    pub chunk_size: u64,
    /// Pause before retrying an event whose processing was deferred
    pub backoff_interval_ms: u64,
    /// Longest an idle agent waits before re-checking the source
    pub heartbeat_interval_ms: u64,
    /// Events fetched per `history` call
    pub history_page_size: usize,
    /// Idle time after which a staging session expires
    pub staging_timeout_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            backoff_interval_ms: 1000,
            heartbeat_interval_ms: 30_000,
            history_page_size: 100,
            staging_timeout_secs: 600,
        }
    }
}

impl ReplicationConfig {
    /// Load config from `path`, falling back to defaults when it is missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read replication config from {:?}", path))?;
        let config: ReplicationConfig = serde_json::from_str(&data)
            .with_context(|| "Failed to parse replication config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to `path` atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be positive");
        }
        if self.backoff_interval_ms == 0 {
            bail!("backoff_interval_ms must be positive");
        }
        if self.heartbeat_interval_ms == 0 {
            bail!("heartbeat_interval_ms must be positive");
        }
        if self.history_page_size == 0 {
            bail!("history_page_size must be positive");
        }
        if self.staging_timeout_secs == 0 {
            bail!("staging_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn backoff_interval(&self) -> Duration {
        Duration::from_millis(self.backoff_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn staging_timeout(&self) -> Duration {
        Duration::from_secs(self.staging_timeout_secs)
    }
}
