//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on malformed values. Everything has
//! a default, so an empty environment is a valid configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::SchedulerConfig;
use crate::error::{Error, Result};

const DEFAULT_LEDGER: &str = "chainwork.db";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path of the SQLite ledger file.
    pub ledger_path: PathBuf,
    pub workers: Option<usize>,
    pub max_attempts: Option<u32>,
    pub poll_ms: Option<u64>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from(DEFAULT_LEDGER),
            workers: None,
            max_attempts: None,
            poll_ms: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// The binary loads a `.env` file with `dotenvy` first.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            ledger_path: std::env::var("CHAINWORK_LEDGER")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_path),
            workers: parsed_var("CHAINWORK_WORKERS")?,
            max_attempts: parsed_var("CHAINWORK_MAX_ATTEMPTS")?,
            poll_ms: parsed_var("CHAINWORK_POLL_MS")?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok().filter(|s| !s.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Scheduler settings, with defaults for anything not configured.
    pub fn scheduler(&self) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        SchedulerConfig {
            workers: self.workers.unwrap_or(defaults.workers),
            default_max_attempts: self.max_attempts.unwrap_or(defaults.default_max_attempts),
            poll_interval: self
                .poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            ..defaults
        }
    }

    fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let value = raw
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}")))?;
    Ok(Some(value))
}
