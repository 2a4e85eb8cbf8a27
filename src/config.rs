//! Configuration management for Gatekeeper.
//!
//! The service file selects the counter store and the fallback policy and
//! points at the rule file. Values may be overridden from the environment with
//! `GATEKEEPER__` prefixed variables, e.g. `GATEKEEPER__STORE__BACKEND=redis`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::FallbackMode;

/// Main configuration for an embedded engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Path to the rate limit rules file
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Behaviour while the counter store is unreachable
    #[serde(default)]
    pub fallback: FallbackConfig,
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreKind,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub redis: RedisConfig,
}

/// In-process store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// How often idle counters are swept; 0 disables the sweeper
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl MemoryConfig {
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Redis store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,

    /// Compare-and-set attempts per update
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_redis_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "gatekeeper:".to_string()
}

fn default_redis_timeout() -> u64 {
    50
}

fn default_max_attempts() -> u32 {
    8
}

/// Fallback policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub mode: FallbackMode,

    /// Minimum time between store probes while degraded
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            mode: FallbackMode::default(),
            probe_interval_ms: default_probe_interval(),
        }
    }
}

impl FallbackConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

fn default_probe_interval() -> u64 {
    1000
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file, applying `GATEKEEPER__*` overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .add_source(config::Environment::with_prefix("GATEKEEPER").separator("__"))
            .build()
            .map_err(|e| GatekeeperError::Configuration(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| GatekeeperError::Configuration(e.to_string()))
    }

    /// Parse configuration from a YAML string without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Configuration(e.to_string()))
    }
}
