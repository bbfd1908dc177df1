//! ---
//! eb_section: "01-core-functionality"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Shared primitives and utilities for the core runtime."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_device_id_env() -> String {
    "AWS_IOT_THING_NAME".to_owned()
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_subscribe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_workers_per_core() -> usize {
    2
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for an EdgeBus component.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "EDGEBUS_CONFIG";

    /// Load configuration from disk, respecting the `EDGEBUS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        self.transport.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity of the device and the base of its topic schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub base_topic: String,
    #[serde(default)]
    pub device_id: Option<String>,
    /// Environment variable consulted when `device_id` is not set.
    #[serde(default = "default_device_id_env")]
    pub device_id_env: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            base_topic: String::new(),
            device_id: None,
            device_id_env: default_device_id_env(),
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        let base = self.base_topic.trim();
        if base.is_empty() {
            return Err(anyhow!("device.base_topic must not be empty"));
        }
        if base.contains(['+', '#']) {
            return Err(anyhow!(
                "device.base_topic '{}' must not contain MQTT wildcards",
                base
            ));
        }
        if let Some(id) = &self.device_id {
            if id.trim().is_empty() || id.contains('/') {
                return Err(anyhow!("device.device_id '{}' is not a valid topic segment", id));
            }
        }
        Ok(())
    }

    /// Resolve the device identifier from config, falling back to the environment.
    pub fn resolve_device_id(&self) -> Result<String> {
        if let Some(id) = &self.device_id {
            return Ok(id.trim().to_owned());
        }
        match std::env::var(&self.device_id_env) {
            Ok(id) if !id.trim().is_empty() => Ok(id.trim().to_owned()),
            _ => Err(anyhow!(
                "device.device_id is unset and environment variable {} is empty",
                self.device_id_env
            )),
        }
    }
}

/// Timeouts and worker pool sizing shared by both transports.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "publish_timeout_ms", default = "default_publish_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub publish_timeout: Duration,
    #[serde(rename = "subscribe_timeout_ms", default = "default_subscribe_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub subscribe_timeout: Duration,
    #[serde(default = "default_workers_per_core")]
    pub workers_per_core: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            publish_timeout: default_publish_timeout(),
            subscribe_timeout: default_subscribe_timeout(),
            workers_per_core: default_workers_per_core(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers_per_core == 0 {
            return Err(anyhow!("transport.workers_per_core must be at least 1"));
        }
        if self.publish_timeout.is_zero() || self.subscribe_timeout.is_zero() {
            return Err(anyhow!("transport timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// Worker pool size derived from the available cores.
    pub fn worker_pool_size(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.saturating_mul(self.workers_per_core).max(1)
    }
}

/// Additional topics subscribed at startup, besides the ingress topic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub local: IndexSet<String>,
    #[serde(default)]
    pub broker: IndexSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
