//! Startup configuration, read once and never reloaded.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::{
    cache::FallbackConfig,
    error::{RateLimitError, Result},
    limiter::EngineConfig,
    liveness::LivenessConfig,
    redis::RedisConfig,
    ring::DEFAULT_REPLICAS,
    utils::generate_node_id,
};

/// Environment variables override file values, e.g. `SLIDEGATE__REDIS__HOST`
pub const ENV_PREFIX: &str = "SLIDEGATE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub fallback: FallbackSettings,

    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

/// Admission defaults applied when a check leaves a field unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    #[serde(default = "default_window_ms")]
    pub default_window_ms: u64,

    /// Default burst is `ceil(limit * burst_ratio)`
    #[serde(default = "default_burst_ratio")]
    pub burst_ratio: f64,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_window_ms: default_window_ms(),
            burst_ratio: default_burst_ratio(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_burst_ratio() -> f64 {
    0.1
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSettings {
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            max_keys: default_max_keys(),
            retention_ms: default_retention_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

fn default_max_keys() -> usize {
    10_000
}

fn default_retention_ms() -> u64 {
    3_600_000
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Random `node-<hex>` when not configured
    #[serde(default = "generate_node_id")]
    pub id: String,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Other node ids to track in the hash ring
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: generate_node_id(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            peers: Vec::new(),
            replicas: default_replicas(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_ttl_secs() -> u64 {
    30
}

fn default_shutdown_timeout_ms() -> u64 {
    1_000
}

fn default_replicas() -> usize {
    DEFAULT_REPLICAS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    pub password: Option<String>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_command_timeout_ms() -> u64 {
    1_000
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Key clients on `X-Forwarded-For`; only safe behind a proxy that sets it
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_for: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

impl Settings {
    /// Layer an optional YAML file under `SLIDEGATE__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("node.peers")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RateLimitError::Config(format!("Failed to load settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a literal YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("rate_limit.default_limit", self.rate_limit.default_limit),
            ("rate_limit.default_window_ms", self.rate_limit.default_window_ms),
            ("rate_limit.store_timeout_ms", self.rate_limit.store_timeout_ms),
            ("fallback.cleanup_interval_ms", self.fallback.cleanup_interval_ms),
            ("node.heartbeat_interval_ms", self.node.heartbeat_interval_ms),
            ("node.heartbeat_ttl_secs", self.node.heartbeat_ttl_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(RateLimitError::Config(format!("{} must be greater than zero", name)));
        }
        if !self.rate_limit.burst_ratio.is_finite() || self.rate_limit.burst_ratio < 0.0 {
            return Err(RateLimitError::Config(
                "rate_limit.burst_ratio must be a non-negative number".to_string(),
            ));
        }
        if self.node.id.trim().is_empty() {
            return Err(RateLimitError::Config("node.id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_limit: self.rate_limit.default_limit,
            default_window: Duration::from_millis(self.rate_limit.default_window_ms),
            burst_ratio: self.rate_limit.burst_ratio,
            store_timeout: Duration::from_millis(self.rate_limit.store_timeout_ms),
        }
    }

    pub fn fallback_config(&self) -> FallbackConfig {
        FallbackConfig {
            max_keys: self.fallback.max_keys,
            retention: Duration::from_millis(self.fallback.retention_ms),
            cleanup_interval: Duration::from_millis(self.fallback.cleanup_interval_ms),
        }
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            heartbeat_interval: Duration::from_millis(self.node.heartbeat_interval_ms),
            ttl_secs: self.node.heartbeat_ttl_secs,
            shutdown_timeout: Duration::from_millis(self.node.shutdown_timeout_ms),
        }
    }

    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            host: self.redis.host.clone(),
            port: self.redis.port,
            password: self.redis.password.clone(),
            connection_timeout: Duration::from_millis(self.redis.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.redis.command_timeout_ms),
            retry_base: Duration::from_millis(self.redis.retry_base_ms),
            retry_max: Duration::from_millis(self.redis.retry_max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.rate_limit.default_limit, 100);
        assert_eq!(settings.rate_limit.default_window_ms, 60_000);
        assert_eq!(settings.fallback.max_keys, 10_000);
        assert_eq!(settings.node.heartbeat_interval_ms, 5_000);
        assert_eq!(settings.node.replicas, 256);
        assert_eq!(settings.redis.port, 6379);
        assert_eq!(settings.server.http_addr.port(), 3000);
        assert!(!settings.server.trust_forwarded_for);
        assert!(settings.node.id.starts_with("node-"));
        assert_ok!(settings.validate());
    }

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
rate_limit:
  default_limit: 10
  burst_ratio: 0.5
node:
  id: edge-1
  peers: [edge-2, edge-3]
redis:
  host: redis.internal
  password: hunter2
server:
  http_addr: "127.0.0.1:8080"
  trust_forwarded_for: true
"#;

        let settings = assert_ok!(Settings::from_yaml(yaml));
        assert_eq!(settings.rate_limit.default_limit, 10);
        assert_eq!(settings.rate_limit.default_window_ms, 60_000);
        assert_eq!(settings.node.id, "edge-1");
        assert_eq!(settings.node.peers, vec!["edge-2", "edge-3"]);
        assert_eq!(settings.server.http_addr.port(), 8080);
        assert!(settings.server.trust_forwarded_for);

        let engine = settings.engine_config();
        assert_eq!(engine.burst_ratio, 0.5);
        assert_eq!(engine.default_window, Duration::from_secs(60));

        let redis = settings.redis_config();
        assert_eq!(redis.url(), "redis://:hunter2@redis.internal:6379/");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let settings = assert_ok!(Settings::from_yaml("{}"));
        assert_eq!(settings.rate_limit.store_timeout_ms, 2_000);
        assert_eq!(settings.liveness_config().ttl_secs, 30);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let err = assert_err!(Settings::from_yaml("rate_limit:\n  default_window_ms: 0\n"));
        assert!(err.to_string().contains("default_window_ms"));

        assert_err!(Settings::from_yaml("node:\n  heartbeat_interval_ms: 0\n"));
        assert_err!(Settings::from_yaml("rate_limit:\n  burst_ratio: -1.0\n"));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = assert_err!(Settings::from_yaml("rate_limit: [1, 2"));
        assert!(matches!(err, RateLimitError::Config(_)));
    }

    #[test]
    fn test_load_without_file() {
        let settings = assert_ok!(Settings::load(None));
        assert_eq!(settings.fallback.retention_ms, 3_600_000);
    }

    #[test]
    fn test_fallback_config_conversion() {
        let settings = Settings::default();
        let fallback = settings.fallback_config();
        assert_eq!(fallback.retention, Duration::from_secs(3600));
        assert_eq!(fallback.cleanup_interval, Duration::from_secs(60));
    }
}
