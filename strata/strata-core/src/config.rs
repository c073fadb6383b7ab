//! Configuration for the Strata state cache.
//!
//! Configuration is read from `~/.strata/config.toml` by default; the
//! location can be overridden with the `STRATA_CONFIG_PATH` environment
//! variable. A missing file yields the defaults. Individual values can be
//! overridden through `STRATA_*` environment variables, which win over the
//! file.
//!
//! # Example
//!
//! ```toml
//! [general]
//! log_level = "debug"
//!
//! [reload]
//! worker_pool_size = 4
//! state_timeout_ms = 10000
//! max_rounds = 8
//!
//! [watcher]
//! filesystem = false
//! ```

use crate::error::{Result, StrataError};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

// Environment variable names
pub const ENV_CONFIG_PATH: &str = "STRATA_CONFIG_PATH";
pub const ENV_LOG_LEVEL: &str = "STRATA_LOG_LEVEL";
pub const ENV_RELOAD_WORKERS: &str = "STRATA_RELOAD_WORKERS";
pub const ENV_STATE_TIMEOUT_MS: &str = "STRATA_STATE_TIMEOUT_MS";
pub const ENV_MAX_ROUNDS: &str = "STRATA_MAX_ROUNDS";
pub const ENV_WATCH_FILESYSTEM: &str = "STRATA_WATCH_FILESYSTEM";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub general: GeneralConfig,
    pub reload: ReloadConfig,
    pub watcher: WatcherConfig,
}

/// General configuration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Reload orchestration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Maximum number of projects reloading at the same time
    pub worker_pool_size: usize,
    /// Hard-hold window of a cached state, in milliseconds
    pub state_timeout_ms: u64,
    /// Upper bound on rounds of a single reload
    pub max_rounds: usize,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            state_timeout_ms: 5_000,
            max_rounds: 16,
        }
    }
}

impl ReloadConfig {
    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }
}

/// File watching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Install an OS-level file watcher for loaded files
    pub filesystem: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { filesystem: true }
    }
}

impl StrataConfig {
    /// Load configuration from the default location, applying environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed, or if
    /// the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            let mut config = Self::default();
            config.merge_env_vars()?;
            config.validate()?;
            return Ok(config);
        }
        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .map_err(|e| StrataError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_toml_str(&content)?;
        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a specific path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, self.to_toml_string()?)?;
        std::fs::rename(&temp_path, path)?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Get the configuration file path (~/.strata/config.toml)
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(config_path) = std::env::var(ENV_CONFIG_PATH) {
            return Ok(PathBuf::from(config_path));
        }

        let base_dirs = BaseDirs::new()
            .ok_or_else(|| StrataError::config("Could not determine home directory"))?;

        Ok(base_dirs.home_dir().join(".strata").join("config.toml"))
    }

    /// Apply `STRATA_*` overrides from the process environment.
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn merge_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(log_level) = lookup(ENV_LOG_LEVEL) {
            debug!("Overriding log_level from environment: {}", log_level);
            self.general.log_level = log_level;
        }

        if let Some(workers) = lookup(ENV_RELOAD_WORKERS) {
            self.reload.worker_pool_size = workers.parse().map_err(|e| {
                StrataError::config(format!("Invalid {} in environment: {}", ENV_RELOAD_WORKERS, e))
            })?;
        }

        if let Some(timeout) = lookup(ENV_STATE_TIMEOUT_MS) {
            self.reload.state_timeout_ms = timeout.parse().map_err(|e| {
                StrataError::config(format!("Invalid {} in environment: {}", ENV_STATE_TIMEOUT_MS, e))
            })?;
        }

        if let Some(rounds) = lookup(ENV_MAX_ROUNDS) {
            self.reload.max_rounds = rounds.parse().map_err(|e| {
                StrataError::config(format!("Invalid {} in environment: {}", ENV_MAX_ROUNDS, e))
            })?;
        }

        if let Some(watch) = lookup(ENV_WATCH_FILESYSTEM) {
            self.watcher.filesystem = match watch.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(StrataError::config(format!(
                        "Invalid {} in environment: '{}'",
                        ENV_WATCH_FILESYSTEM, other
                    )));
                }
            };
        }

        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.general.log_level.as_str()) {
            return Err(StrataError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.general.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.reload.worker_pool_size == 0 {
            return Err(StrataError::config("worker_pool_size must be at least 1"));
        }

        if self.reload.state_timeout_ms == 0 {
            return Err(StrataError::config("state_timeout_ms must be positive"));
        }

        if self.reload.max_rounds < 2 {
            return Err(StrataError::config("max_rounds must be at least 2"));
        }

        Ok(())
    }
}
