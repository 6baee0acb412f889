use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::{
    metrics::Metrics,
    utils::{ticker, Clock, TaskHandle},
};

/// Sizing for the degraded-mode counters
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Key count above which a recording call triggers an eager prune pass
    pub max_keys: usize,
    /// Timestamps older than this are dropped by a prune pass
    pub retention: Duration,
    /// Period of the background prune pass
    pub cleanup_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_keys: 10_000,
            retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Process-local sliding-window counters used while the shared store is unreachable.
///
/// Each limiter key maps to the timestamps of its recent requests. The map is
/// sharded, so concurrent recordings against unrelated keys do not contend; a
/// read-modify-write on one key holds only that key's shard.
#[derive(Debug)]
pub struct LocalFallbackCache {
    entries: DashMap<String, Vec<u64>>,
    config: FallbackConfig,
}

impl LocalFallbackCache {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Drop timestamps at or before `now - window`, record `now`, and return
    /// how many requests the key now holds inside the window.
    pub fn record_and_count(&self, key: &str, now_ms: u64, window_ms: u64) -> u64 {
        let window_start = now_ms.saturating_sub(window_ms);
        let count = {
            let mut timestamps = self.entries.entry(key.to_string()).or_default();
            timestamps.retain(|&ts| ts > window_start);
            timestamps.push(now_ms);
            timestamps.len() as u64
        };

        if self.entries.len() > self.config.max_keys {
            let dropped = self.cleanup(now_ms);
            debug!(dropped, remaining = self.entries.len(), "Eager fallback cache prune");
        }

        count
    }

    /// Prune every entry to the retention horizon, dropping keys left empty.
    /// Returns the number of keys dropped.
    pub fn cleanup(&self, now_ms: u64) -> usize {
        let horizon = now_ms.saturating_sub(self.config.retention.as_millis() as u64);
        let before = self.entries.len();
        self.entries.retain(|_, timestamps| {
            timestamps.retain(|&ts| ts > horizon);
            !timestamps.is_empty()
        });
        before.saturating_sub(self.entries.len())
    }

    /// Forget a key entirely. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Timestamps currently held for a key, without recording anything
    pub fn count(&self, key: &str) -> u64 {
        self.entries
            .get(key)
            .map(|timestamps| timestamps.len() as u64)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `cleanup` every `cleanup_interval` until the handle is stopped
    pub fn spawn_cleanup(
        cache: Arc<Self>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> TaskHandle {
        let period = cache.config.cleanup_interval;
        TaskHandle::spawn("fallback-cleanup", move |mut stop| async move {
            let mut ticker = ticker(period);
            // The first tick completes immediately; nothing to prune yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dropped = cache.cleanup(clock.now_millis());
                        metrics.set_fallback_keys(cache.len());
                        if dropped > 0 {
                            debug!(dropped, "Pruned fallback cache");
                        }
                    }
                    _ = &mut stop => break,
                }
            }
        })
    }
}

impl Default for LocalFallbackCache {
    fn default() -> Self {
        Self::new(FallbackConfig::default())
    }
}
