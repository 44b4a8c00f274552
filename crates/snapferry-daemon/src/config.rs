//! Daemon configuration file.

use serde::{Deserialize, Serialize};
use snapferry_scheduler::RunnerConfig;
use snapferry_transport::HttpConfig;
use std::path::Path;
use tracing::warn;

/// Everything `snapferry serve` reads from its configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Replication server settings.
    pub http: HttpConfig,
    /// Lifecycle runner settings.
    pub runner: RunnerConfig,
    /// Filesystems created in the in-memory driver at startup.
    pub filesystems: Vec<String>,
}

impl DaemonConfig {
    /// Parses a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Like [`DaemonConfig::from_file`], but a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            warn!("Config file not found, using defaults: {}", path.display());
            Ok(Self::default())
        }
    }
}
