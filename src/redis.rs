use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    error::{RateLimitError, Result},
    store::{CounterStore, NodeHealthRecord, NodeStatus, StatIncrement},
    utils::{node_key, window_member, window_ttl_secs},
};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    /// Delay after the first failed connect; grows linearly per attempt
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            connection_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(1),
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_millis(2000),
        }
    }
}

impl RedisConfig {
    /// Connection URL built from host, port and optional password
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}/", password, self.host, self.port)
            }
            _ => format!("redis://{}:{}/", self.host, self.port),
        }
    }

    /// Wait before the next connect after `attempt` consecutive failures:
    /// `retry_base * attempt`, capped at `retry_max`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base
            .checked_mul(attempt.max(1))
            .unwrap_or(self.retry_max)
            .min(self.retry_max)
    }
}

#[derive(Debug, Default)]
struct ReconnectState {
    failed_attempts: u32,
    next_attempt_at: Option<Instant>,
}

/// Redis-backed `CounterStore`.
///
/// The connection is established lazily on first use. A failed connect schedules
/// the next attempt after a linearly growing, capped delay; until then every
/// operation fails fast with `StoreUnavailable`. Once established, the
/// `ConnectionManager` reconnects on its own.
pub struct RedisClient {
    client: redis::Client,
    connection: RwLock<Option<ConnectionManager>>,
    reconnect: Mutex<ReconnectState>,
    connected: AtomicBool,
    config: RedisConfig,
}

impl RedisClient {
    /// Create a new Redis client. Does not touch the network.
    pub fn new(config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        info!(host = %config.host, port = config.port, "Redis client created");
        Ok(Self {
            client,
            connection: RwLock::new(None),
            reconnect: Mutex::new(ReconnectState::default()),
            connected: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Whether the last interaction with Redis succeeded
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get the shared connection, connecting first if necessary
    async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        // One task connects at a time; the rest fail over to the caller's fallback.
        let Ok(mut reconnect) = self.reconnect.try_lock() else {
            return Err(RateLimitError::StoreUnavailable(
                "connection attempt in progress".to_string(),
            ));
        };

        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        if let Some(at) = reconnect.next_attempt_at {
            if Instant::now() < at {
                return Err(RateLimitError::StoreUnavailable(
                    "waiting to retry connection".to_string(),
                ));
            }
        }

        let attempt = tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_connection_manager(),
        )
        .await;

        let failure = match attempt {
            Ok(Ok(conn)) => {
                info!("Redis connected successfully");
                *reconnect = ReconnectState::default();
                self.connected.store(true, Ordering::SeqCst);
                *self.connection.write().await = Some(conn.clone());
                return Ok(conn);
            }
            Ok(Err(e)) => RateLimitError::Redis(e),
            Err(_) => RateLimitError::Timeout(self.config.connection_timeout),
        };

        self.connected.store(false, Ordering::SeqCst);
        reconnect.failed_attempts = reconnect.failed_attempts.saturating_add(1);
        let delay = self.config.retry_delay(reconnect.failed_attempts);
        reconnect.next_attempt_at = Some(Instant::now() + delay);
        warn!(
            attempt = reconnect.failed_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %failure,
            "Redis connection failed"
        );
        Err(failure)
    }

    /// Run one command (or atomic pipeline) with the command timeout applied,
    /// keeping the connection flag in step with the outcome.
    async fn run<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.config.command_timeout, f(conn)).await {
            Ok(Ok(value)) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                debug!(operation, error = %e, "Redis operation failed");
                Err(RateLimitError::Redis(e))
            }
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                debug!(operation, "Redis operation timed out");
                Err(RateLimitError::Timeout(self.config.command_timeout))
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisClient {
    async fn is_ready(&self) -> bool {
        self.run("ping", |mut conn| async move {
            redis::cmd("PING").query_async::<_, ()>(&mut conn).await
        })
        .await
        .is_ok()
    }

    async fn sliding_window_check(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64> {
        let window_start = now_ms.saturating_sub(window_ms);
        let member = window_member(now_ms);
        let ttl = window_ttl_secs(window_ms) as i64;

        let (count,): (u64,) = self
            .run("sliding_window", |mut conn| async move {
                redis::pipe()
                    .atomic()
                    .zrembyscore(key, "-inf", window_start)
                    .ignore()
                    .zadd(key, member, now_ms)
                    .ignore()
                    .zcard(key)
                    .expire(key, ttl)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(count)
    }

    async fn increment_stats(&self, increments: &[StatIncrement], ttl_secs: u64) -> Result<()> {
        if increments.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for increment in increments {
            pipe.hincr(&increment.bucket, &increment.field, 1).ignore();
        }
        let mut buckets: Vec<&str> = increments.iter().map(|i| i.bucket.as_str()).collect();
        buckets.sort_unstable();
        buckets.dedup();
        for bucket in buckets {
            pipe.expire(bucket, ttl_secs as i64).ignore();
        }

        self.run("increment_stats", |mut conn| async move {
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn cardinality(&self, key: &str) -> Result<u64> {
        self.run("zcard", |mut conn| async move { conn.zcard(key).await })
            .await
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        self.run("del", |mut conn| async move { conn.del::<_, ()>(key).await })
            .await
    }

    async fn publish_heartbeat(&self, node_id: &str, now_ms: u64, ttl_secs: u64) -> Result<()> {
        let key = node_key(node_id);
        let fields = [
            ("lastHeartbeat", now_ms.to_string()),
            ("status", NodeStatus::Active.as_str().to_string()),
        ];
        self.run("heartbeat", |mut conn| async move {
            redis::pipe()
                .atomic()
                .hset_multiple(&key, &fields)
                .ignore()
                .expire(&key, ttl_secs as i64)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn mark_shutdown(&self, node_id: &str, ttl_secs: u64) -> Result<()> {
        let key = node_key(node_id);
        self.run("mark_shutdown", |mut conn| async move {
            redis::pipe()
                .atomic()
                .hset(&key, "status", NodeStatus::Shutdown.as_str())
                .ignore()
                .expire(&key, ttl_secs as i64)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn node_health(&self, node_id: &str) -> Result<Option<NodeHealthRecord>> {
        let key = node_key(node_id);
        let fields: HashMap<String, String> = self
            .run("node_health", |mut conn| async move { conn.hgetall(&key).await })
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(NodeHealthRecord::from_fields(node_id, &fields))
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_url() {
        let config = RedisConfig::default();
        assert_eq!(config.url(), "redis://localhost:6379/");

        let config = RedisConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            password: Some("s3cret".to_string()),
            ..Default::default()
        };
        assert_eq!(config.url(), "redis://:s3cret@cache.internal:6380/");
    }

    #[test]
    fn test_retry_delay_is_linear_and_capped() {
        let config = RedisConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(5), Duration::from_millis(500));
        assert_eq!(config.retry_delay(20), Duration::from_millis(2000));
        assert_eq!(config.retry_delay(u32::MAX), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_not_ready() {
        // Nothing listens on port 1; the connect is refused immediately.
        let client = RedisClient::new(RedisConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connection_timeout: Duration::from_millis(300),
            ..Default::default()
        })
        .unwrap();

        assert!(!client.is_ready().await);
        assert!(!client.is_connected());

        // The retry delay has not elapsed, so the next call fails fast.
        let err = client.sliding_window_check("k", 1_000, 1_000).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
