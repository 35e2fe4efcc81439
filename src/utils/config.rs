//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `XCCL_*` environment variables override config file values.
//! Example: `XCCL_WAIT_POLL_INTERVAL_MS=5` overrides `wait_poll_interval_ms`.

use crate::utils::error::{Result, XcclError};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const ENV_PREFIX: &str = "XCCL_";

/// Process group configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XcclConfig {
    /// Device type tag every tensor handed to the group must carry
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Host polling interval used by `CollectiveTask::wait`
    #[serde(default = "default_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,

    /// Timeout used by `synchronize` and by blocking waits
    #[serde(default = "default_wait_timeout_ms")]
    pub default_wait_timeout_ms: u64,

    /// Fail a wait with a timeout error once its deadline passes
    #[serde(default = "default_true")]
    pub strict_wait_timeout: bool,

    /// Block `sync_op` calls until the collective completes
    #[serde(default)]
    pub blocking_wait: bool,

    /// Prefix of the keys published to the rendezvous store
    #[serde(default = "default_store_namespace")]
    pub store_namespace: String,
}

fn default_device_type() -> String { "custom_cpu".to_string() }
fn default_poll_interval_ms() -> u64 { 10 }
fn default_wait_timeout_ms() -> u64 { 30 * 60 * 1000 }
fn default_true() -> bool { true }
fn default_store_namespace() -> String { "ProcessGroupCustom".to_string() }

impl Default for XcclConfig {
    fn default() -> Self {
        Self {
            device_type: default_device_type(),
            wait_poll_interval_ms: default_poll_interval_ms(),
            default_wait_timeout_ms: default_wait_timeout_ms(),
            strict_wait_timeout: true,
            blocking_wait: false,
            store_namespace: default_store_namespace(),
        }
    }
}

impl XcclConfig {
    /// Config for a group over the given device type, all else default.
    pub fn for_device_type(device_type: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }

    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| XcclError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration from a file, then apply `XCCL_*` overrides.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            self.apply_override(&field.to_lowercase(), &value);
        }
    }

    fn apply_override(&mut self, field: &str, value: &str) {
        match field {
            "device_type" => self.device_type = value.to_string(),
            "wait_poll_interval_ms" => if let Ok(v) = value.parse() { self.wait_poll_interval_ms = v; }
            "default_wait_timeout_ms" => if let Ok(v) = value.parse() { self.default_wait_timeout_ms = v; }
            "strict_wait_timeout" => self.strict_wait_timeout = parse_flag(value),
            "blocking_wait" => self.blocking_wait = parse_flag(value),
            "store_namespace" => self.store_namespace = value.to_string(),
            _ => {
                debug!(field = %field, "Ignoring unknown XCCL_ override");
            }
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.device_type.is_empty() {
            return Err(XcclError::Config("device_type must not be empty".to_string()));
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(XcclError::Config(
                "wait_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.store_namespace.is_empty() {
            return Err(XcclError::Config("store_namespace must not be empty".to_string()));
        }
        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| XcclError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
