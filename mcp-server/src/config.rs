//! Layered server configuration.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, `./maas-mcp.toml`, or
//!    `<config_dir>/maas-mcp/config.toml`)
//! 3. Environment variables with the `MAAS_MCP_` prefix and `__` nesting,
//!    e.g. `MAAS_MCP_RETRY__MAX_ATTEMPTS=5`

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::Config;
use config::Environment;
use config::File;
use maas_operations::OperationServices;
use maas_operations::OperationsRegistry;
use maas_operations::RateLimitConfig;
use maas_operations::RateLimitHistory;
use maas_operations::RegistryConfig;
use maas_operations::RetryPolicy;
use serde::Deserialize;
use serde::Serialize;

use crate::backend::ApiKey;

pub const ENV_PREFIX: &str = "MAAS_MCP";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration value: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub operations: OperationsConfig,
}

/// MAAS region controller connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the MAAS API, e.g. `http://maas.example:5240/MAAS`.
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// `consumer:token:secret` API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

/// Progress notification rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_true")]
    pub always_send_first: bool,

    #[serde(default = "default_true")]
    pub always_send_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_max_completed_age_secs")]
    pub max_completed_age_secs: u64,

    #[serde(default = "default_max_stale_age_secs")]
    pub max_stale_age_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Upper bound on a tracked tool call; unbounded when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Delay between machine status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_backend_url() -> String {
    "http://localhost:5240/MAAS".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_min_interval_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_max_completed_age_secs() -> u64 {
    5 * 60
}
fn default_max_stale_age_secs() -> u64 {
    30 * 60
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    5000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            api_key: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            always_send_first: default_true(),
            always_send_last: default_true(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_completed_age_secs: default_max_completed_age_secs(),
            max_stale_age_secs: default_max_stale_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.backend.url)
            .map_err(|e| ConfigError::Validation(format!("backend.url: {e}")))?;
        if let Some(key) = &self.backend.api_key {
            ApiKey::parse(key).map_err(|e| ConfigError::Validation(format!("backend.api_key: {e}")))?;
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.registry.max_completed_age_secs > self.registry.max_stale_age_secs {
            return Err(ConfigError::Validation(format!(
                "registry.max_completed_age_secs ({}) exceeds registry.max_stale_age_secs ({})",
                self.registry.max_completed_age_secs, self.registry.max_stale_age_secs
            )));
        }
        if self.registry.sweep_interval_secs == 0 || self.operations.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "registry.sweep_interval_secs and operations.poll_interval_ms must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.initial_delay_ms),
        )
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            min_interval: Duration::from_millis(self.progress.min_interval_ms),
            always_send_first: self.progress.always_send_first,
            always_send_last: self.progress.always_send_last,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_completed_age: Duration::from_secs(self.registry.max_completed_age_secs),
            max_stale_age: Duration::from_secs(self.registry.max_stale_age_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.registry.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.operations.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.operations.timeout_secs.map(Duration::from_secs)
    }

    /// Fresh stores and policies for one server instance.
    pub fn operation_services(&self) -> OperationServices {
        OperationServices::new(
            Arc::new(OperationsRegistry::new(self.registry_config())),
            Arc::new(RateLimitHistory::new()),
        )
        .with_rate_limit(self.rate_limit())
        .with_retry_policy(self.retry_policy())
        .with_request_timeout(self.request_timeout())
    }
}

/// Configuration loader with layered merging.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn load(&self) -> Result<ServerConfig> {
        let mut builder = Config::builder();

        let defaults_json = serde_json::to_string(&ServerConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// First existing file among `./maas-mcp.toml` and
    /// `<config_dir>/maas-mcp/config.toml`.
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./maas-mcp.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }
        dirs::config_dir()
            .map(|dir| dir.join("maas-mcp").join("config.toml"))
            .filter(|path| path.exists())
    }

    pub fn load_default() -> Result<ServerConfig> {
        match Self::find_config_file() {
            Some(path) => ConfigLoader::new().with_file(path).load(),
            None => ConfigLoader::new().load(),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
