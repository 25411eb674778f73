use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Synchronization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the sync timer (milliseconds)
    pub sync_interval_ms: u64,

    /// Head block age above which the node counts as stale (seconds)
    pub stale_after_secs: u64,

    /// Rows requested per get-table-rows page
    pub page_limit: u32,

    /// Contract account owning the mirrored tables
    pub contract: String,

    pub journal_table: String,
    pub journal_scope: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 2500,
            stale_after_secs: 10,
            page_limit: 100,
            contract: "fmv".to_string(),
            journal_table: "journal".to_string(),
            journal_scope: "global".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_ms == 0 {
            return Err(Error::Config("sync_interval_ms must be positive".into()));
        }
        if self.page_limit == 0 {
            return Err(Error::Config("page_limit must be positive".into()));
        }
        if self.contract.is_empty() || self.journal_table.is_empty() {
            return Err(Error::Config("contract and journal_table must be named".into()));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}
