// Configuration management with layered configuration (file, env)

use crate::sites::HttpSiteConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub observability: ObservabilityConfig,
    /// HTTP page watchers defined in configuration
    pub sites: Vec<HttpSiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the `cache/`, `subscriptions/` and `dedup/` namespaces
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_fetches: usize,
    pub fetch_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
    /// Capacity of the change event channel between scheduler and dispatcher
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            fetch_timeout_seconds: 30,
            shutdown_grace_seconds: 10,
            event_buffer: 256,
        }
    }
}

impl SchedulerConfig {
    pub fn engine_config(&self) -> crate::scheduler::SchedulerConfig {
        crate::scheduler::SchedulerConfig {
            max_concurrent_fetches: self.max_concurrent_fetches,
            fetch_timeout_seconds: self.fetch_timeout_seconds,
            shutdown_grace_seconds: self.shutdown_grace_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub dedup_enabled: bool,
    pub dedup_window_days: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_enabled: false,
            dedup_window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// `json` or `pretty`
    pub log_format: String,
    /// Prometheus exporter port; no exporter when unset
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            metrics_port: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err("Storage data_dir cannot be empty".to_string());
        }

        if self.scheduler.max_concurrent_fetches == 0 {
            return Err("Scheduler max_concurrent_fetches must be greater than 0".to_string());
        }
        if self.scheduler.fetch_timeout_seconds == 0 {
            return Err("Scheduler fetch_timeout_seconds must be greater than 0".to_string());
        }
        if self.scheduler.shutdown_grace_seconds == 0 {
            return Err("Scheduler shutdown_grace_seconds must be greater than 0".to_string());
        }
        if self.scheduler.event_buffer == 0 {
            return Err("Scheduler event_buffer must be greater than 0".to_string());
        }

        if self.dispatcher.dedup_enabled && self.dispatcher.dedup_window_days == 0 {
            return Err("Dispatcher dedup_window_days must be greater than 0".to_string());
        }

        let mut names = HashSet::new();
        for site in &self.sites {
            if site.name.trim().is_empty() {
                return Err("Configured site name cannot be empty".to_string());
            }
            if site.url.trim().is_empty() {
                return Err(format!("Configured site '{}' has an empty url", site.name));
            }
            if !names.insert(site.name.as_str()) {
                return Err(format!("Configured site '{}' is defined twice", site.name));
            }
        }

        Ok(())
    }
}
