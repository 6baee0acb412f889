//! The counting backend seen from the engine's side.
//!
//! `CounterStore` is the narrow set of operations the admission core needs from a
//! shared key-value store: an atomic prune-insert-count over a sorted set, hash
//! field increments for usage statistics, key deletion and cardinality, node
//! health records and a readiness probe. `RedisClient` is the production
//! implementation; `MemoryStore` keeps the same semantics inside the process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{
    error::{RateLimitError, Result},
    utils::{node_key, window_member, window_ttl_secs, Clock},
};

/// Lifecycle status a node publishes about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Active,
    Shutdown,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Shutdown => "shutdown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(NodeStatus::Active),
            "shutdown" => Some(NodeStatus::Shutdown),
            _ => None,
        }
    }
}

/// Health record a node keeps under `node:<id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealthRecord {
    pub node_id: String,
    pub last_heartbeat_ms: Option<u64>,
    pub status: NodeStatus,
}

impl NodeHealthRecord {
    /// Build a record from the raw hash fields (`lastHeartbeat`, `status`)
    pub fn from_fields(node_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let status = NodeStatus::parse(fields.get("status")?)?;
        Some(Self {
            node_id: node_id.to_string(),
            last_heartbeat_ms: fields.get("lastHeartbeat").and_then(|v| v.parse().ok()),
            status,
        })
    }
}

/// One `HINCRBY <bucket> <field> 1` in a statistics batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatIncrement {
    pub bucket: String,
    pub field: String,
}

impl StatIncrement {
    pub fn new(bucket: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            field: field.into(),
        }
    }
}

/// Operations the admission core requires from the shared counting backend.
///
/// Every method either reports what the backend actually did or returns an error;
/// implementations never invent a result while disconnected.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Last known connection state combined with a live probe
    async fn is_ready(&self) -> bool;

    /// In one atomic batch: drop members scored at or before `now - window`,
    /// add a unique member scored `now`, read the cardinality and refresh the
    /// key expiry to `ceil(window / 1000)` seconds. Returns the cardinality.
    async fn sliding_window_check(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64>;

    /// Apply every increment and refresh each touched bucket's expiry, atomically
    async fn increment_stats(&self, increments: &[StatIncrement], ttl_secs: u64) -> Result<()>;

    /// Number of members in the sorted set at `key`, zero when absent
    async fn cardinality(&self, key: &str) -> Result<u64>;

    async fn delete_key(&self, key: &str) -> Result<()>;

    /// Set `{lastHeartbeat: now, status: active}` on the node record and refresh its TTL
    async fn publish_heartbeat(&self, node_id: &str, now_ms: u64, ttl_secs: u64) -> Result<()>;

    /// Set `status: shutdown` on the node record and refresh its TTL, so a
    /// record recreated after expiry still expires
    async fn mark_shutdown(&self, node_id: &str, ttl_secs: u64) -> Result<()>;

    async fn node_health(&self, node_id: &str) -> Result<Option<NodeHealthRecord>>;

    /// Store type name for logs
    fn store_type(&self) -> &'static str;
}

#[derive(Debug, Clone)]
enum StoredValue {
    SortedSet(Vec<(u64, String)>),
    Hash(HashMap<String, i64>),
    Record(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at_ms: Option<u64>,
}

/// In-process `CounterStore` with the same observable semantics as the Redis adapter.
///
/// Expiry is evaluated lazily against the injected clock. Availability can be
/// switched off, and the store can be told to stall so callers hit their timeouts.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    stalled: AtomicBool,
    data: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            available: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// When stalled, every operation after the readiness probe hangs forever
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Current integer value of a statistics hash field
    pub async fn hash_field(&self, key: &str, field: &str) -> Option<i64> {
        let mut data = self.data.lock().await;
        match Self::live(&mut data, key, self.clock.now_millis()) {
            Some(StoredEntry {
                value: StoredValue::Hash(fields),
                ..
            }) => fields.get(field).copied(),
            _ => None,
        }
    }

    /// Milliseconds until `key` expires, `None` if absent or persistent
    pub async fn ttl_millis(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock().await;
        Self::live(&mut data, key, now)
            .and_then(|entry| entry.expires_at_ms)
            .map(|at| at.saturating_sub(now))
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let mut data = self.data.lock().await;
        Self::live(&mut data, key, self.clock.now_millis()).is_some()
    }

    async fn ensure_available(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RateLimitError::StoreUnavailable(
                "memory store switched off".to_string(),
            ));
        }
        if self.stalled.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        Ok(())
    }

    fn live<'a>(
        data: &'a mut HashMap<String, StoredEntry>,
        key: &str,
        now_ms: u64,
    ) -> Option<&'a mut StoredEntry> {
        let expired = data
            .get(key)
            .and_then(|entry| entry.expires_at_ms)
            .is_some_and(|at| at <= now_ms);
        if expired {
            data.remove(key);
        }
        data.get_mut(key)
    }

    fn wrong_type(key: &str) -> RateLimitError {
        RateLimitError::Redis(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "WRONGTYPE Operation against a key holding the wrong kind of value",
            key.to_string(),
        )))
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("available", &self.available.load(Ordering::SeqCst))
            .field("stalled", &self.stalled.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn is_ready(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn sliding_window_check(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64> {
        self.ensure_available().await?;
        let window_start = now_ms.saturating_sub(window_ms);
        let mut data = self.data.lock().await;
        if Self::live(&mut data, key, self.clock.now_millis()).is_none() {
            data.insert(
                key.to_string(),
                StoredEntry {
                    value: StoredValue::SortedSet(Vec::new()),
                    expires_at_ms: None,
                },
            );
        }
        let entry = data
            .get_mut(key)
            .ok_or_else(|| RateLimitError::StoreUnavailable("entry vanished".to_string()))?;
        let StoredValue::SortedSet(members) = &mut entry.value else {
            return Err(Self::wrong_type(key));
        };
        members.retain(|(score, _)| *score > window_start);
        members.push((now_ms, window_member(now_ms)));
        members.sort_by_key(|(score, _)| *score);
        let count = members.len() as u64;
        entry.expires_at_ms = Some(now_ms + window_ttl_secs(window_ms) * 1000);
        Ok(count)
    }

    async fn increment_stats(&self, increments: &[StatIncrement], ttl_secs: u64) -> Result<()> {
        self.ensure_available().await?;
        let now = self.clock.now_millis();
        let mut data = self.data.lock().await;
        for increment in increments {
            if let Some(entry) = Self::live(&mut data, &increment.bucket, now) {
                if !matches!(entry.value, StoredValue::Hash(_)) {
                    return Err(Self::wrong_type(&increment.bucket));
                }
            }
        }
        for increment in increments {
            let entry = data
                .entry(increment.bucket.clone())
                .or_insert_with(|| StoredEntry {
                    value: StoredValue::Hash(HashMap::new()),
                    expires_at_ms: None,
                });
            if let StoredValue::Hash(fields) = &mut entry.value {
                *fields.entry(increment.field.clone()).or_insert(0) += 1;
            }
            entry.expires_at_ms = Some(now + ttl_secs * 1000);
        }
        Ok(())
    }

    async fn cardinality(&self, key: &str) -> Result<u64> {
        self.ensure_available().await?;
        let mut data = self.data.lock().await;
        match Self::live(&mut data, key, self.clock.now_millis()) {
            None => Ok(0),
            Some(StoredEntry {
                value: StoredValue::SortedSet(members),
                ..
            }) => Ok(members.len() as u64),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        self.ensure_available().await?;
        self.data.lock().await.remove(key);
        Ok(())
    }

    async fn publish_heartbeat(&self, node_id: &str, now_ms: u64, ttl_secs: u64) -> Result<()> {
        self.ensure_available().await?;
        let key = node_key(node_id);
        let mut data = self.data.lock().await;
        let mut fields = match Self::live(&mut data, &key, self.clock.now_millis()) {
            Some(StoredEntry {
                value: StoredValue::Record(fields),
                ..
            }) => fields.clone(),
            _ => HashMap::new(),
        };
        fields.insert("lastHeartbeat".to_string(), now_ms.to_string());
        fields.insert("status".to_string(), NodeStatus::Active.as_str().to_string());
        data.insert(
            key,
            StoredEntry {
                value: StoredValue::Record(fields),
                expires_at_ms: Some(now_ms + ttl_secs * 1000),
            },
        );
        Ok(())
    }

    async fn mark_shutdown(&self, node_id: &str, ttl_secs: u64) -> Result<()> {
        self.ensure_available().await?;
        let key = node_key(node_id);
        let now = self.clock.now_millis();
        let mut data = self.data.lock().await;
        let mut fields = match Self::live(&mut data, &key, now) {
            Some(StoredEntry {
                value: StoredValue::Record(fields),
                ..
            }) => fields.clone(),
            Some(_) => return Err(Self::wrong_type(&key)),
            None => HashMap::new(),
        };
        fields.insert("status".to_string(), NodeStatus::Shutdown.as_str().to_string());
        data.insert(
            key,
            StoredEntry {
                value: StoredValue::Record(fields),
                expires_at_ms: Some(now + ttl_secs * 1000),
            },
        );
        Ok(())
    }

    async fn node_health(&self, node_id: &str) -> Result<Option<NodeHealthRecord>> {
        self.ensure_available().await?;
        let key = node_key(node_id);
        let mut data = self.data.lock().await;
        match Self::live(&mut data, &key, self.clock.now_millis()) {
            None => Ok(None),
            Some(StoredEntry {
                value: StoredValue::Record(fields),
                ..
            }) => Ok(NodeHealthRecord::from_fields(node_id, fields)),
            Some(_) => Err(Self::wrong_type(&key)),
        }
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
