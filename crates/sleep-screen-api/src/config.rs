use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DB_PATH: &str = "./sleep_screen.sqlite3";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LIMIT: usize = 10;
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Runtime settings, loaded from YAML. Every field is optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ScreeningConfig {
    pub db_path: PathBuf,
    pub store_timeout_ms: u64,
    pub default_limit: usize,
    pub log_filter: String,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            default_limit: DEFAULT_LIMIT,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl ScreeningConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid config YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error for malformed YAML or unknown keys.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("invalid screening config")
    }

    #[must_use]
    pub fn with_db_path(mut self, db_path: PathBuf) -> Self {
        self.db_path = db_path;
        self
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
