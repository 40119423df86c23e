//! Configuration management
//!
//! Handles:
//! - Store connection settings
//! - Optional host label and sampling cadence
//! - Retention window and strategy
//!
//! Sources, lowest precedence first: built-in defaults, the TOML config file,
//! then environment variables (a `.env` file is loaded by `main`).

use crate::discovery::HostLabel;
use crate::error::ConfigError;
use crate::retention::{RetentionPolicy, RetentionStrategy, RetentionWindow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Connection string variables, first match wins
const DATABASE_URL_VARS: &[&str] = &[
    "PERFWATCH_DATABASE_URL",
    "NEON_DATABASE_URL",
    "DATABASE_URL",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub store: StoreConfig,
    pub agent: SamplingConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// PostgreSQL URL, or `memory://` for an in-process store
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    /// Create `server_performance` when it does not exist yet
    pub bootstrap_schema: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub label: Option<String>,
    pub interval_secs: u64,
    pub cpu_sample_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_samples: u64,
    pub strategy: RetentionStrategy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            // one connection keeps every write and delete sequential
            max_connections: 1,
            connect_timeout_secs: 10,
            bootstrap_schema: true,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            label: None,
            interval_secs: 5,
            cpu_sample_ms: 100,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_samples: RetentionWindow::DEFAULT.max_samples(),
            strategy: RetentionStrategy::default(),
        }
    }
}

impl AgentConfig {
    /// Load from the config file (if any), apply environment overrides and validate
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_file_path();
        let mut config = match &path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                debug!("No config file at {}, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// `$PERFWATCH_CONFIG`, else `<config dir>/perfwatch-agent/config.toml`
    pub fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("PERFWATCH_CONFIG") {
            return Some(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()?;
        path.push("perfwatch-agent");
        path.push("config.toml");
        Some(path)
    }

    /// Overlay values from the environment; `lookup` abstracts `std::env::var`
    ///
    /// A numeric override that does not parse is an error, never ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = DATABASE_URL_VARS.iter().find_map(|key| lookup(key)) {
            self.store.database_url = Some(url);
        }
        if let Some(label) = lookup("PERFWATCH_SERVER_NAME") {
            self.agent.label = Some(label);
        }
        if let Some(secs) = parse_env(&lookup, "PERFWATCH_INTERVAL_SECS")? {
            self.agent.interval_secs = secs;
        }
        if let Some(max) = parse_env(&lookup, "PERFWATCH_MAX_SAMPLES")? {
            self.retention.max_samples = max;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.store.database_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingDatabaseUrl),
        }
        if self.agent.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "agent.interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.cpu_window() >= self.interval() {
            return Err(ConfigError::InvalidValue {
                key: "agent.cpu_sample_ms",
                reason: "cpu window must be shorter than the sampling interval".into(),
            });
        }
        RetentionWindow::new(self.retention.max_samples).map_err(|e| {
            ConfigError::InvalidValue {
                key: "retention.max_samples",
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.agent.interval_secs)
    }

    pub fn cpu_window(&self) -> Duration {
        Duration::from_millis(self.agent.cpu_sample_ms)
    }

    pub fn label(&self) -> Option<HostLabel> {
        self.agent.label.as_deref().and_then(HostLabel::parse)
    }

    pub fn retention_policy(&self) -> Result<RetentionPolicy, ConfigError> {
        let window = RetentionWindow::new(self.retention.max_samples).map_err(|e| {
            ConfigError::InvalidValue {
                key: "retention.max_samples",
                reason: e.to_string(),
            }
        })?;
        Ok(RetentionPolicy::new(window, self.retention.strategy))
    }
}

fn parse_env<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key,
            reason: format!("{:?} is not a whole number: {}", raw, e),
        })
}
