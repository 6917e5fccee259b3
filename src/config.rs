//! Configuration for the alarm host.

use crate::error::{AlarmError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChimeConfig {
    /// Alarm database location.
    pub store: StoreConfig,
    /// Handler execution limits.
    pub dispatch: DispatchConfig,
    /// Host command channel sizing.
    pub host: HostConfig,
    /// Log filtering and file output.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Explicit database file. When unset, `alarms.db` under the data dir.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Database file this configuration points at.
    #[must_use]
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(crate::chime_dirs::alarm_db_file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on handlers running at the same time across all ids.
    pub max_concurrent_handlers: usize,
    /// Seconds an idle per-alarm lane waits before its worker exits.
    pub lane_idle_secs: u64,
    /// Fire events held across a failed start; the oldest are dropped first.
    pub max_pending_fires: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 16,
            lane_idle_secs: 30,
            max_pending_fires: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Pending commands buffered between the bridge and the server.
    pub request_capacity: usize,
    /// Broadcast buffer for host events; slow readers lose the oldest.
    pub event_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            request_capacity: 64,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Also write a daily rolling log under the logs dir.
    pub file_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "chime=info".to_owned(),
            file_logging: false,
        }
    }
}

impl ChimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AlarmError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only for a file that exists but does not parse.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AlarmError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `config_dir()/config.toml`.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::chime_dirs::config_file()
    }
}
