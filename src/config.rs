use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Options used when opening a [`DocVault`](crate::DocVault).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultOptions {
    /// Directory holding the journal. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Lock timeout applied when a descriptor does not carry one.
    pub default_lock_timeout_secs: f64,
    /// Force a journal fsync on every commit, regardless of `wait_for_sync`.
    pub sync_on_commit: bool,
    /// Whether reads of undeclared collections take an implicit shared lock.
    pub allow_implicit_collections: bool,
    /// Maximum number of summaries kept in the `_trx` collection.
    pub transaction_log_capacity: u32,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_lock_timeout_secs: 30.0,
            sync_on_commit: false,
            allow_implicit_collections: true,
            transaction_log_capacity: 1000,
        }
    }
}

impl VaultOptions {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }

    /// Parse options from a JSON object, e.g. a config file section.
    pub fn from_json(value: &Value) -> Result<Self> {
        let opts: VaultOptions = serde_json::from_value(value.clone())
            .map_err(|e| Error::BadParameter(format!("invalid options: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Read options from `DOCVAULT_DATA`, `DOCVAULT_LOCK_TIMEOUT` and `DOCVAULT_SYNC`.
    pub fn from_env() -> Result<Self> {
        let mut opts = Self::default();
        if let Ok(dir) = env::var("DOCVAULT_DATA") {
            opts.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(raw) = env::var("DOCVAULT_LOCK_TIMEOUT") {
            opts.default_lock_timeout_secs = raw.parse().map_err(|_| {
                Error::BadParameter(format!("DOCVAULT_LOCK_TIMEOUT is not a number: {raw}"))
            })?;
        }
        if let Ok(raw) = env::var("DOCVAULT_SYNC") {
            opts.sync_on_commit = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.default_lock_timeout_secs.is_finite() || self.default_lock_timeout_secs < 0.0 {
            return Err(Error::BadParameter(
                "default_lock_timeout_secs must be a non-negative number".into(),
            ));
        }
        if self.transaction_log_capacity == 0 {
            return Err(Error::BadParameter(
                "transaction_log_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn default_lock_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.default_lock_timeout_secs).unwrap_or(Duration::MAX)
    }
}
