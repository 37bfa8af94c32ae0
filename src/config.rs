//! Fleet configuration: the TOML config file and its tuning knobs.
//!
//! The file has two tables. `[servers]` holds the ordered upstream list;
//! `[config]` holds the tuning knobs, all optional with defaults. A parsed
//! config serialises back to the same upstreams in the same order, which is
//! what the hot-reload diff relies on.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One entry of the `[servers]` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub url: Url,
    pub max_concurrent_requests: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServersSection {
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
}

/// The `[config]` table. Intervals and timeouts are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub health_check_interval: u64,
    pub health_check_timeout: u64,
    pub health_check_min_success_rate: f64,
    pub health_check_max_response_time: f64,
    pub health_check_consecutive_failures: u32,
    pub health_check_window_size: usize,
    pub config_reload_interval: u64,
    pub enable_active_health_check: bool,
    pub request_timeout: u64,
    pub max_retries: u32,
    pub retry_delay: f64,
    pub failure_threshold: u32,
    pub auto_recovery_threshold: u64,
    /// Cadence of the model discoverer. Defaults to `config_reload_interval`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_discovery_interval: Option<u64>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            health_check_interval: 10,
            health_check_timeout: 5,
            health_check_min_success_rate: 0.8,
            health_check_max_response_time: 3.0,
            health_check_consecutive_failures: 3,
            health_check_window_size: 10,
            config_reload_interval: 30,
            enable_active_health_check: true,
            request_timeout: 120,
            max_retries: 3,
            retry_delay: 0.1,
            failure_threshold: 3,
            auto_recovery_threshold: 60,
            model_discovery_interval: None,
        }
    }
}

impl Tuning {
    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout.max(1))
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.config_reload_interval.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(
            self.model_discovery_interval
                .unwrap_or(self.config_reload_interval)
                .max(1),
        )
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay.max(0.0))
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.auto_recovery_threshold)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub servers: ServersSection,
    #[serde(default, rename = "config")]
    pub tuning: Tuning,
}

/// Ensures the base URL ends in a slash so `Url::join` appends path segments
/// instead of replacing the last one.
fn normalize_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl ConfigFile {
    /// Reads, parses, and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parses and validates config file contents.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config: ConfigFile = toml::from_str(contents)?;
        config.validate()?;
        for spec in &mut config.servers.servers {
            spec.url = normalize_url(spec.url.clone());
        }
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for spec in &self.servers.servers {
            if !matches!(spec.url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "server url {} must use http or https",
                    spec.url
                )));
            }
            if spec.max_concurrent_requests == 0 {
                return Err(ConfigError::Invalid(format!(
                    "server {} has max_concurrent_requests = 0",
                    spec.url
                )));
            }
            if !seen.insert(spec.url.as_str().to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server url {}",
                    spec.url
                )));
            }
        }
        if self.tuning.health_check_min_success_rate < 0.0
            || self.tuning.health_check_min_success_rate > 1.0
        {
            return Err(ConfigError::Invalid(
                "health_check_min_success_rate must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}
