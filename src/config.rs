//! Configuration module.
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every section is optional; a missing file yields the defaults.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! api_key = "${CHATSTREAM_API_KEY}"
//!
//! [redis]
//! url = "redis://localhost:6379"
//!
//! [worker]
//! consumer_group = "chatstream_workers"
//! batch_size = 100
//! claim_idle_ms = 30000
//!
//! [search]
//! url = "${SEARCH_URL}"
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consumer::{DEFAULT_CLAIM_IDLE, DEFAULT_CLAIM_INTERVAL, MAX_BATCH_SIZE};

/// Env var naming the config file
pub const CONFIG_PATH_ENV: &str = "CHATSTREAM_CONFIG";

/// Env var overriding the worker name
pub const WORKER_NAME_ENV: &str = "CHATSTREAM_WORKER_NAME";

const DEFAULT_CONFIG_PATH: &str = "config/chatstream.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid substitution pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChatstreamConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub streams: StreamsConfig,

    /// Search service; search-sync entries only reach a real index when set
    #[serde(default)]
    pub search: Option<SearchConfig>,
}

/// Ingestion API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Idle time after which another consumer takes over a pending entry
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    #[serde(default = "default_claim_interval_ms")]
    pub claim_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            consumer_group: default_consumer_group(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            claim_idle_ms: default_claim_idle_ms(),
            claim_interval_ms: default_claim_interval_ms(),
        }
    }
}

fn default_consumer_group() -> String {
    "chatstream_workers".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_block_ms() -> u64 {
    5000
}

fn default_error_backoff_ms() -> u64 {
    1000
}

fn default_claim_idle_ms() -> u64 {
    DEFAULT_CLAIM_IDLE.as_millis() as u64
}

fn default_claim_interval_ms() -> u64 {
    DEFAULT_CLAIM_INTERVAL.as_millis() as u64
}

impl WorkerConfig {
    /// Consumer name: configured name, then `CHATSTREAM_WORKER_NAME`, then
    /// `worker-<hostname>`, then `worker-<uuid>`.
    pub fn resolve_name(&self) -> String {
        if let Some(name) = self.name.as_ref().filter(|name| !name.is_empty()) {
            return name.clone();
        }

        if let Ok(name) = env::var(WORKER_NAME_ENV) {
            return name;
        }

        if let Ok(hostname) = hostname::get() {
            if let Some(name) = hostname.to_str() {
                return format!("worker-{}", name);
            }
        }

        format!("worker-{}", uuid::Uuid::new_v4())
    }

    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_millis(self.claim_interval_ms)
    }
}

/// Stream configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StreamsConfig {
    /// Approximate cap applied on every append
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
        }
    }
}

fn default_max_len() -> usize {
    crate::producer::DEFAULT_MAX_LEN
}

/// Search service configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    pub url: String,

    #[serde(default = "default_index")]
    pub index: String,

    #[serde(default = "default_alias")]
    pub alias: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_index() -> String {
    "chat-rooms-v1".to_string()
}

fn default_alias() -> String {
    "chat-rooms".to_string()
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_retries() -> u32 {
    2
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ChatstreamConfig {
    /// Load configuration from the default path or CHATSTREAM_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content)?;

        info!(
            consumer_group = %config.worker.consumer_group,
            search = config.search.is_some(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate TOML text, substituting `${VAR}` first.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;

        debug!("Parsing TOML configuration");
        let config: ChatstreamConfig = toml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(ConfigError::ValidationError(
                "Redis URL must start with redis:// or rediss://".to_string(),
            ));
        }

        if self.worker.consumer_group.is_empty() {
            return Err(ConfigError::ValidationError(
                "Consumer group must not be empty".to_string(),
            ));
        }

        if self.worker.batch_size == 0 || self.worker.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "Worker batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }

        // BLOCK 0 waits forever
        if self.worker.block_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Worker block_ms must be positive".to_string(),
            ));
        }

        if self.worker.claim_idle_ms == 0 || self.worker.claim_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Worker claim_idle_ms and claim_interval_ms must be positive".to_string(),
            ));
        }

        if self.streams.max_len == 0 {
            return Err(ConfigError::ValidationError(
                "Stream max_len must be positive".to_string(),
            ));
        }

        if let Some(api_key) = &self.server.api_key {
            if api_key.contains("${") {
                warn!("API key contains unsubstituted environment variable");
            }
        }

        if let Some(search) = &self.search {
            if search.url.contains("${") {
                warn!(
                    url = %search.url,
                    "Search URL contains unsubstituted environment variable"
                );
            } else if !search.url.starts_with("http://") && !search.url.starts_with("https://") {
                return Err(ConfigError::ValidationError(
                    "Search URL must start with http:// or https://".to_string(),
                ));
            }

            if search.index.is_empty() || search.alias.is_empty() {
                return Err(ConfigError::ValidationError(
                    "Search index and alias must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// The search section, unless its URL still holds a placeholder.
    pub fn usable_search(&self) -> Option<&SearchConfig> {
        self.search
            .as_ref()
            .filter(|search| !search.url.contains("${"))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;

    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("CHATSTREAM_TEST_VAR", "substituted_value");
        let input = "url = \"${CHATSTREAM_TEST_VAR}\"";
        let output = substitute_env_vars(input).unwrap();
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("CHATSTREAM_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input).unwrap();
        assert_eq!(output, "url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = ChatstreamConfig::parse(
            r#"
            [server]
            port = 4000
        "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert!(config.search.is_none());
    }

    #[test]
    fn test_parse_worker_and_search() {
        let config = ChatstreamConfig::parse(
            r#"
            [worker]
            name = "worker-a"
            consumer_group = "chat"
            batch_size = 50
            block_ms = 2000
            error_backoff_ms = 250

            [streams]
            max_len = 500

            [search]
            url = "http://search:9200"
            retries = 4
        "#,
        )
        .unwrap();

        assert_eq!(config.worker.resolve_name(), "worker-a");
        assert_eq!(config.worker.consumer_group, "chat");
        assert_eq!(config.worker.batch_size, 50);
        assert_eq!(config.worker.block(), Duration::from_secs(2));
        assert_eq!(config.worker.error_backoff(), Duration::from_millis(250));
        assert_eq!(config.streams.max_len, 500);

        let search = config.usable_search().unwrap();
        assert_eq!(search.index, "chat-rooms-v1");
        assert_eq!(search.alias, "chat-rooms");
        assert_eq!(search.timeout(), Duration::from_secs(10));
        assert_eq!(search.retries, 4);
    }

    #[test]
    fn test_default_config() {
        let config = ChatstreamConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.worker.consumer_group, "chatstream_workers");
        assert_eq!(config.worker.batch_size, 100);
        assert_eq!(config.worker.block(), Duration::from_secs(5));
        assert_eq!(config.streams.max_len, 10_000);
    }

    #[test]
    fn test_worker_name_fallback_is_prefixed() {
        let worker = WorkerConfig::default();
        if env::var(WORKER_NAME_ENV).is_err() {
            assert!(worker.resolve_name().starts_with("worker-"));
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = ChatstreamConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.worker.batch_size, 100);
    }

    #[test]
    fn test_validation_batch_size_bounds() {
        let result = ChatstreamConfig::parse(
            r#"
            [worker]
            batch_size = 101
        "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let result = ChatstreamConfig::parse(
            r#"
            [worker]
            batch_size = 0
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_zero_block() {
        let result = ChatstreamConfig::parse(
            r#"
            [worker]
            block_ms = 0
        "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_claim_settings() {
        let config = ChatstreamConfig::parse(
            r#"
            [worker]
            claim_idle_ms = 60000
        "#,
        )
        .unwrap();
        assert_eq!(config.worker.claim_idle(), Duration::from_secs(60));
        assert_eq!(config.worker.claim_interval(), DEFAULT_CLAIM_INTERVAL);

        let result = ChatstreamConfig::parse(
            r#"
            [worker]
            claim_idle_ms = 0
        "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_invalid_search_url() {
        let result = ChatstreamConfig::parse(
            r#"
            [search]
            url = "not-a-url"
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unsubstituted_search_is_not_usable() {
        let config = ChatstreamConfig::parse(
            r#"
            [search]
            url = "${CHATSTREAM_UNSET_SEARCH_URL}"
        "#,
        )
        .unwrap();
        assert!(config.search.is_some());
        assert!(config.usable_search().is_none());
    }

    #[test]
    fn test_validation_invalid_redis_url() {
        let result = ChatstreamConfig::parse(
            r#"
            [redis]
            url = "http://localhost"
        "#,
        );
        assert!(result.is_err());
    }
}
