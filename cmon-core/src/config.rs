//! Configuration management.

use crate::backoff::RetryPolicy;
use crate::error::{CmonError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Port the per-host metrics agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 9163;

/// Process configuration for cmond.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub metrics_port: u16,
    pub server_name: String,
    pub log_level: String,
    pub vmapi: ServiceConfig,
    pub cnapi: ServiceConfig,
    pub changefeed: ChangefeedConfig,
    pub poll_interval_secs: u64,
    pub discovery_page_size: usize,
    pub include_stopped: bool,
    pub compression_enabled: bool,
    pub agent_port: u16,
    pub agent_connect_timeout_ms: u64,
    pub queue_capacity: usize,
    pub resolver_retry: RetryConfig,
    pub api_retry: RetryConfig,
}

/// Base URL of an upstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub url: String,
}

/// Changefeed registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangefeedConfig {
    /// Feed URL; defaults to `<vmapi>/changefeed` when unset.
    pub url: Option<String>,
    pub instance: String,
    pub resource: String,
    pub sub_resources: Vec<String>,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
    pub jitter_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9163,
            metrics_port: 9164,
            server_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "cmon".to_string()),
            log_level: "info".to_string(),
            vmapi: ServiceConfig { url: "http://vmapi.local".to_string() },
            cnapi: ServiceConfig { url: "http://cnapi.local".to_string() },
            changefeed: ChangefeedConfig::default(),
            poll_interval_secs: 300,
            discovery_page_size: 100,
            include_stopped: false,
            compression_enabled: false,
            agent_port: DEFAULT_AGENT_PORT,
            agent_connect_timeout_ms: 1000,
            queue_capacity: 16,
            resolver_retry: RetryConfig::default(),
            api_retry: RetryConfig {
                max_attempts: 10,
                min_delay_ms: 2000,
                max_delay_ms: 10_000,
                factor: 2.0,
                jitter_ms: 250,
            },
        }
    }
}

impl Default for ChangefeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            instance: "cmon".to_string(),
            resource: "vm".to_string(),
            sub_resources: vec![
                "alias".to_string(),
                "customer_metadata".to_string(),
                "destroyed".to_string(),
                "nics".to_string(),
                "owner_uuid".to_string(),
                "server_uuid".to_string(),
                "state".to_string(),
                "tags".to_string(),
            ],
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay_ms: 100,
            max_delay_ms: 10_000,
            factor: 2.0,
            jitter_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Build the retry policy described by this configuration.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.factor,
            Duration::from_millis(self.jitter_ms),
        )
    }
}

impl Config {
    /// Load configuration from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            None => Self::default(),
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|e| CmonError::InvalidConfig {
                        reason: format!("Failed to read config {}: {}", path.display(), e),
                    })?;
                serde_json::from_str(&content).map_err(|e| CmonError::InvalidConfig {
                    reason: format!("Failed to parse config {}: {}", path.display(), e),
                })?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(invalid("poll_interval_secs must be greater than zero"));
        }
        if self.discovery_page_size == 0 {
            return Err(invalid("discovery_page_size must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be greater than zero"));
        }
        let policies = [("resolver_retry", &self.resolver_retry), ("api_retry", &self.api_retry)];
        for (name, retry) in policies {
            if retry.max_attempts == 0 {
                return Err(invalid(&format!("{}.max_attempts must be at least 1", name)));
            }
            if retry.min_delay_ms > retry.max_delay_ms {
                return Err(invalid(&format!("{}.min_delay_ms exceeds max_delay_ms", name)));
            }
        }
        for (name, url) in [("vmapi.url", &self.vmapi.url), ("cnapi.url", &self.cnapi.url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(&format!("{} must be an http(s) URL, got {:?}", name, url)));
            }
        }
        Ok(())
    }

    /// Interval between host directory polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// URL the changefeed transport connects to.
    pub fn changefeed_url(&self) -> String {
        self.changefeed
            .url
            .clone()
            .unwrap_or_else(|| format!("{}/changefeed", self.vmapi.url.trim_end_matches('/')))
    }

    /// Inventory state filter used while bootstrapping.
    pub fn bootstrap_state_filter(&self) -> &'static str {
        if self.include_stopped {
            "active"
        } else {
            "running"
        }
    }
}

fn invalid(reason: &str) -> CmonError {
    CmonError::InvalidConfig { reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(300));
        assert_eq!(config.bootstrap_state_filter(), "running");
        assert_eq!(config.changefeed_url(), "http://vmapi.local/changefeed");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"vmapi": {{"url": "http://10.0.0.2/"}}, "include_stopped": true, "poll_interval_secs": 60}}"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.poll_interval_secs, 60);
        assert!(config.include_stopped);
        assert_eq!(config.bootstrap_state_filter(), "active");
        assert_eq!(config.changefeed_url(), "http://10.0.0.2/changefeed");
        assert_eq!(config.agent_port, DEFAULT_AGENT_PORT);
    }

    #[test]
    fn test_rejects_zero_queue() {
        let config = Config { queue_capacity: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(CmonError::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_bad_url() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cnapi": {{"url": "cnapi.local"}}}}"#).unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }
}
