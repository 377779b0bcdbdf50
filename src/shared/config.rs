use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::driver::ProxmoxConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_driver_timeout_secs")]
    pub driver_timeout_secs: u64,
    /// How many completed operations per container are kept for idempotent replay.
    #[serde(default = "default_idempotency_window")]
    pub idempotency_window: usize,
    /// Template used when a create request carries no spec.
    #[serde(default = "default_template")]
    pub default_template: String,
}

impl OrchestratorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: default_lock_timeout_secs(),
            driver_timeout_secs: default_driver_timeout_secs(),
            idempotency_window: default_idempotency_window(),
            default_template: default_template(),
        }
    }
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_driver_timeout_secs() -> u64 {
    120
}

fn default_idempotency_window() -> usize {
    32
}

fn default_template() -> String {
    "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst".to_string()
}

fn default_database_url() -> String {
    "sqlite://nuages.sqlite3?mode=rwc".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub proxmox: Option<ProxmoxConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: default_log_dir(),
            orchestrator: OrchestratorConfig::default(),
            proxmox: None,
        }
    }
}

impl Config {
    /// Defaults, overridden by the environment (and a `.env` file if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Reads a YAML file, then lets the environment override it.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::load_yaml(path, |key| std::env::var(key).ok())
    }

    fn load_yaml(
        path: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("NUAGES_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(dir) = lookup("NUAGES_LOG_DIR") {
            self.log_dir = dir;
        }
        if let Some(secs) = lookup("NUAGES_LOCK_TIMEOUT_SECS") {
            self.orchestrator.lock_timeout_secs = parse("NUAGES_LOCK_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("NUAGES_DRIVER_TIMEOUT_SECS") {
            self.orchestrator.driver_timeout_secs = parse("NUAGES_DRIVER_TIMEOUT_SECS", &secs)?;
        }
        if let Some(window) = lookup("NUAGES_IDEMPOTENCY_WINDOW") {
            self.orchestrator.idempotency_window = parse("NUAGES_IDEMPOTENCY_WINDOW", &window)?;
        }
        if let Some(template) = lookup("NUAGES_DEFAULT_TEMPLATE") {
            self.orchestrator.default_template = template;
        }

        // The four credentials come as a set; any one of them switches Proxmox on
        let host = lookup("PROXMOX_HOST");
        let user = lookup("PROXMOX_USER");
        let token_name = lookup("PROXMOX_TOKEN_NAME");
        let token_value = lookup("PROXMOX_TOKEN_VALUE");
        if host.is_some() || user.is_some() || token_name.is_some() || token_value.is_some() {
            let base = self.proxmox.take();
            let proxmox = ProxmoxConfig {
                host: require("PROXMOX_HOST", host, base.as_ref().map(|p| p.host.clone()))?,
                user: require("PROXMOX_USER", user, base.as_ref().map(|p| p.user.clone()))?,
                token_name: require(
                    "PROXMOX_TOKEN_NAME",
                    token_name,
                    base.as_ref().map(|p| p.token_name.clone()),
                )?,
                token_value: require(
                    "PROXMOX_TOKEN_VALUE",
                    token_value,
                    base.as_ref().map(|p| p.token_value.clone()),
                )?,
                node: base
                    .as_ref()
                    .map(|p| p.node.clone())
                    .unwrap_or_else(crate::driver::default_proxmox_node),
                storage: base
                    .as_ref()
                    .map(|p| p.storage.clone())
                    .unwrap_or_else(crate::driver::default_proxmox_storage),
                verify_ssl: base.as_ref().is_some_and(|p| p.verify_ssl),
                task_poll_interval_ms: base
                    .as_ref()
                    .map(|p| p.task_poll_interval_ms)
                    .unwrap_or_else(crate::driver::default_proxmox_poll_interval_ms),
            };
            self.proxmox = Some(proxmox);
        }

        if let Some(proxmox) = self.proxmox.as_mut() {
            if let Some(node) = lookup("PROXMOX_NODE") {
                proxmox.node = node;
            }
            if let Some(storage) = lookup("PROXMOX_STORAGE") {
                proxmox.storage = storage;
            }
            if let Some(verify) = lookup("PROXMOX_VERIFY_SSL") {
                proxmox.verify_ssl = parse("PROXMOX_VERIFY_SSL", &verify)?;
            }
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.lock_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "lock timeout must be at least one second".to_string(),
            ));
        }
        if self.orchestrator.driver_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "driver timeout must be at least one second".to_string(),
            ));
        }
        if self.orchestrator.idempotency_window == 0 {
            return Err(ConfigError::Invalid(
                "idempotency window must keep at least one operation".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key} has an invalid value: {value}")))
}

fn require(
    key: &str,
    value: Option<String>,
    fallback: Option<String>,
) -> Result<String, ConfigError> {
    value
        .or(fallback)
        .ok_or_else(|| ConfigError::Invalid(format!("{key} environment variable is not set")))
}
