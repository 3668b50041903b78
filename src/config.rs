//! Configuration management for Turnstile.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::LimiterConfig;

/// Prefix for environment overrides, e.g. `TURNSTILE__LIMITER__LIMIT=50`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Algorithm and parameters applied to every key
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Keyed registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Key shared by requests without a usable identity
    #[serde(default = "default_key")]
    pub default_key: String,

    /// How long an unused key keeps its limiter, in seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// How often idle keys are swept, in seconds
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_key: default_key(),
            retention_secs: default_retention(),
            eviction_interval_secs: default_eviction_interval(),
        }
    }
}

fn default_key() -> String {
    "anonymous".to_string()
}

fn default_retention() -> u64 {
    600
}

fn default_eviction_interval() -> u64 {
    60
}

impl RegistryConfig {
    /// Idle time after which a key is evicted.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Period of the eviction sweep.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    /// Reject settings the registry cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.default_key.trim().is_empty() {
            return Err(TurnstileError::Config("default_key must not be blank".to_string()));
        }
        if self.retention_secs == 0 {
            return Err(TurnstileError::Config("retention_secs must be greater than 0".to_string()));
        }
        if self.eviction_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "eviction_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `TURNSTILE__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            if !path.exists() {
                return Err(TurnstileError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }

        let config: TurnstileConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section before anything is built from it.
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        self.registry.validate()
    }
}
