//! Configuration loaded from `quotaflow.toml`.
//!
//! [`QuotaflowConfig`] holds every tunable; keys missing from the file fall
//! back to defaults. `QUOTAFLOW_API_KEY` and `QUOTAFLOW_BASE_URL` take
//! precedence over the file, and CLI flags over both.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::QuotaflowError;
use crate::state_machine::RetryConfig;
use crate::usage::DEFAULT_WARNING_THRESHOLD;

pub const DEFAULT_CONFIG_FILE: &str = "quotaflow.toml";
pub const API_KEY_ENV: &str = "QUOTAFLOW_API_KEY";
pub const BASE_URL_ENV: &str = "QUOTAFLOW_BASE_URL";

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaflowConfig {
    /// Root URL of the generation backend.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token. Empty means unauthenticated.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Ceiling on how long a request is tracked before it times out.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Usage fraction at which a dimension gets a warning.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    #[serde(default = "default_fetch_max_retries")]
    pub fetch_max_retries: u32,

    #[serde(default = "default_fetch_base_delay_ms")]
    pub fetch_base_delay_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_warning_threshold() -> f64 {
    DEFAULT_WARNING_THRESHOLD
}

fn default_fetch_max_retries() -> u32 {
    3
}

fn default_fetch_base_delay_ms() -> u64 {
    500
}

impl Default for QuotaflowConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_timeout_secs(),
            warning_threshold: default_warning_threshold(),
            fetch_max_retries: default_fetch_max_retries(),
            fetch_base_delay_ms: default_fetch_base_delay_ms(),
        }
    }
}

impl QuotaflowConfig {
    /// Loads `path`, or `quotaflow.toml` in the working directory when `None`.
    ///
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, QuotaflowError> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };
        let mut config = if path.exists() {
            Self::from_toml_str(&std::fs::read_to_string(path)?)?
        } else if explicit {
            return Err(QuotaflowError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, QuotaflowError> {
        Ok(toml::from_str(contents)?)
    }

    /// Overrides file values with non-empty environment values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV)
            && !key.is_empty()
        {
            self.api_key = key;
        }
        if let Some(url) = lookup(BASE_URL_ENV)
            && !url.is_empty()
        {
            self.base_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), QuotaflowError> {
        if self.poll_interval_ms == 0 {
            return Err(QuotaflowError::Config("poll_interval_ms must be positive".into()));
        }
        if self.timeout_secs == 0 {
            return Err(QuotaflowError::Config("timeout_secs must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.warning_threshold) {
            return Err(QuotaflowError::Config(format!(
                "warning_threshold must be within 0..=1, got {}",
                self.warning_threshold
            )));
        }
        Ok(())
    }

    pub fn api_key(&self) -> Option<String> {
        (!self.api_key.is_empty()).then(|| self.api_key.clone())
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig::from(self)
    }
}

/// Runtime knobs for the tracker, derived from [`QuotaflowConfig`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub warning_threshold: f64,
    pub fetch_retry: RetryConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from(&QuotaflowConfig::default())
    }
}

impl From<&QuotaflowConfig> for TrackerConfig {
    fn from(config: &QuotaflowConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            warning_threshold: config.warning_threshold,
            fetch_retry: RetryConfig {
                max_retries: config.fetch_max_retries,
                base_delay_ms: config.fetch_base_delay_ms,
            },
        }
    }
}
