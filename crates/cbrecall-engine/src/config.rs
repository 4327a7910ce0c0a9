//! Recall engine configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};

/// Tunables for the recall state machines.
///
/// `deleg_retry_interval_ms` is the unit both the delegation retry and the
/// post-acknowledgement liveness re-check are scheduled with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    /// Client lease lifetime in seconds
    pub lease_lifetime_secs: u32,
    /// Whether delegations are handed out (and therefore recalled) at all
    pub allow_delegations: bool,
    /// Delay before re-sending a CB_RECALL or re-checking a recalled delegation
    pub deleg_retry_interval_ms: u64,
    /// Last rung of the CB_LAYOUTRECALL NFS4ERR_DELAY backoff ladder
    pub layout_backoff_max_ms: u64,
    /// Callback program identifier placed in every callback compound
    pub callback_ident: u32,
}

impl RecallConfig {
    pub fn with_lease(lease_lifetime_secs: u32) -> Self {
        Self {
            lease_lifetime_secs,
            ..Self::default()
        }
    }

    pub fn lease_lifetime(&self) -> Duration {
        Duration::from_secs(self.lease_lifetime_secs as u64)
    }

    pub fn deleg_retry_interval(&self) -> Duration {
        Duration::from_millis(self.deleg_retry_interval_ms)
    }

    pub fn layout_backoff_max(&self) -> Duration {
        Duration::from_millis(self.layout_backoff_max_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_lifetime_secs == 0 {
            return Err(RecallError::Config {
                reason: "lease lifetime must be non-zero".to_string(),
            });
        }

        if self.deleg_retry_interval_ms == 0 {
            return Err(RecallError::Config {
                reason: "delegation retry interval must be non-zero".to_string(),
            });
        }

        if self.deleg_retry_interval() >= self.lease_lifetime() {
            return Err(RecallError::Config {
                reason: "delegation retry interval must be shorter than the lease".to_string(),
            });
        }

        if self.layout_backoff_max_ms == 0 {
            return Err(RecallError::Config {
                reason: "layout backoff ceiling must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Loads a TOML or JSON config, picked by file extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RecallConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            lease_lifetime_secs: 60,
            allow_delegations: true,
            deleg_retry_interval_ms: 1000,
            layout_backoff_max_ms: 1000,
            callback_ident: 1,
        }
    }
}
