use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::{
    cache::LocalFallbackCache,
    error::{RateLimitError, Result},
    metrics::Metrics,
    store::{CounterStore, StatIncrement},
    utils::{
        generate_limiter_key, hour_bucket, millis_to_datetime, stats_key, stats_users_key, Clock,
        DEFAULT_ACTION,
    },
};

/// Usage statistics buckets live for a day
pub const STATS_TTL_SECS: u64 = 86_400;

/// Deployment-wide defaults for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_limit: u64,
    pub default_window: Duration,
    /// Burst allowance as a fraction of the limit, rounded up, when a check names none
    pub burst_ratio: f64,
    /// Upper bound on any single round trip to the counter store
    pub store_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            default_window: Duration::from_secs(60),
            burst_ratio: 0.1,
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Per-call overrides; anything left `None` falls back to the engine defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOptions {
    pub limit: Option<u64>,
    pub window_ms: Option<u64>,
    pub action: Option<String>,
    pub burst: Option<u64>,
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = Some(window_ms);
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BurstState {
    Used,
    Available,
}

/// Outcome of one admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// Requests inside the window, this one included
    pub current: u64,
    pub limit: u64,
    pub burst: u64,
    /// `max(0, limit + burst - current)`
    pub remaining: u64,
    pub reset_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst_state: Option<BurstState>,
    pub fallback: bool,
}

impl Decision {
    pub fn reset_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.reset_at_ms)
    }

    /// Effective cap: the limit plus its burst allowance
    pub fn capacity(&self) -> u64 {
        self.limit.saturating_add(self.burst)
    }
}

/// Result of attempting the shared-store path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Served(Decision),
    Unavailable,
}

/// Answer to an administrative status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StatusReport {
    Current {
        current: u64,
        identifier: String,
        action: String,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct ResolvedLimits {
    limit: u64,
    window_ms: u64,
    burst: u64,
}

/// The admission decision authority.
///
/// Checks run against the shared counter store when it answers in time and
/// against the process-local fallback cache otherwise. Nothing here ever fails a
/// check: store trouble degrades to a fail-open decision tagged `fallback`.
pub struct RateLimitEngine {
    store: Arc<dyn CounterStore>,
    fallback: Arc<LocalFallbackCache>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    config: EngineConfig,
}

impl RateLimitEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        fallback: Arc<LocalFallbackCache>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            fallback,
            clock,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn fallback_cache(&self) -> &Arc<LocalFallbackCache> {
        &self.fallback
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Burst allowance for a limit when the caller gives none
    pub fn default_burst(&self, limit: u64) -> u64 {
        (limit as f64 * self.config.burst_ratio).ceil().max(0.0) as u64
    }

    /// Decide whether one more request from `identifier` is admitted
    pub async fn check(&self, identifier: &str, options: &CheckOptions) -> Decision {
        let _timer = self.metrics.start_check_timer();
        let limits = self.resolve(options);
        let key = generate_limiter_key(identifier, options.action.as_deref());
        let now = self.clock.now_millis();

        let decision = match self.try_store(&key, now, limits).await {
            StoreOutcome::Served(decision) => {
                self.metrics.record_check("store");
                decision
            }
            StoreOutcome::Unavailable => {
                self.metrics.record_check("fallback");
                self.fallback_decision(&key, now, limits)
            }
        };

        self.record_usage(identifier, decision.allowed, now);

        self.metrics.record_decision(decision.allowed);
        debug!(
            key = %key,
            allowed = decision.allowed,
            current = decision.current,
            fallback = decision.fallback,
            "Admission check"
        );
        decision
    }

    /// Forget all recorded requests for `identifier` / `action`
    pub async fn reset(&self, identifier: &str, action: Option<&str>) -> bool {
        let key = generate_limiter_key(identifier, action);
        let store = &self.store;
        let result = self
            .bounded("delete", async {
                if !store.is_ready().await {
                    return Ok(false);
                }
                store.delete_key(&key).await.map(|_| true)
            })
            .await;

        match result {
            Ok(in_store) => {
                self.fallback.remove(&key);
                debug!(key = %key, in_store, "Rate limit reset");
                true
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to reset rate limit");
                false
            }
        }
    }

    /// Current window population from the shared store.
    ///
    /// Never consults the fallback cache: a local count says nothing about the
    /// other nodes.
    pub async fn status(&self, identifier: &str, action: Option<&str>) -> StatusReport {
        let action = action.unwrap_or(DEFAULT_ACTION);
        let key = generate_limiter_key(identifier, Some(action));
        let store = &self.store;
        let result = self
            .bounded("cardinality", async {
                if !store.is_ready().await {
                    return Err(RateLimitError::StoreUnavailable("not ready".to_string()));
                }
                store.cardinality(&key).await
            })
            .await;

        match result {
            Ok(current) => StatusReport::Current {
                current,
                identifier: identifier.to_string(),
                action: action.to_string(),
            },
            Err(RateLimitError::StoreUnavailable(_)) => StatusReport::Error {
                error: "store unavailable".to_string(),
            },
            Err(e) => {
                error!(key = %key, error = %e, "Failed to get rate limit status");
                StatusReport::Error {
                    error: "status check failed".to_string(),
                }
            }
        }
    }

    fn resolve(&self, options: &CheckOptions) -> ResolvedLimits {
        let limit = options
            .limit
            .filter(|&limit| limit > 0)
            .unwrap_or(self.config.default_limit);
        let window_ms = options
            .window_ms
            .filter(|&window| window > 0)
            .unwrap_or(self.config.default_window.as_millis() as u64);
        let burst = options.burst.unwrap_or_else(|| self.default_burst(limit));
        ResolvedLimits {
            limit,
            window_ms,
            burst,
        }
    }

    async fn try_store(&self, key: &str, now: u64, limits: ResolvedLimits) -> StoreOutcome {
        let store = &self.store;
        let result = self
            .bounded("sliding_window", async {
                if !store.is_ready().await {
                    return Err(RateLimitError::StoreUnavailable("not ready".to_string()));
                }
                store.sliding_window_check(key, now, limits.window_ms).await
            })
            .await;

        match result {
            Ok(current) => StoreOutcome::Served(Self::authoritative_decision(current, now, limits)),
            Err(RateLimitError::StoreUnavailable(reason)) => {
                debug!(key = %key, reason = %reason, "Counter store not ready, using local fallback");
                StoreOutcome::Unavailable
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit check failed, using local fallback");
                StoreOutcome::Unavailable
            }
        }
    }

    fn authoritative_decision(current: u64, now: u64, limits: ResolvedLimits) -> Decision {
        let capacity = limits.limit.saturating_add(limits.burst);
        Decision {
            allowed: current <= capacity,
            current,
            limit: limits.limit,
            burst: limits.burst,
            remaining: capacity.saturating_sub(current),
            reset_at_ms: now.saturating_add(limits.window_ms),
            burst_state: Some(if current > limits.limit {
                BurstState::Used
            } else {
                BurstState::Available
            }),
            fallback: false,
        }
    }

    fn fallback_decision(&self, key: &str, now: u64, limits: ResolvedLimits) -> Decision {
        let current = self.fallback.record_and_count(key, now, limits.window_ms);
        self.metrics.set_fallback_keys(self.fallback.len());
        let capacity = limits.limit.saturating_add(limits.burst);
        Decision {
            // Fail open: an unreachable limiter must not block traffic.
            allowed: true,
            current,
            limit: limits.limit,
            burst: limits.burst,
            remaining: capacity.saturating_sub(current),
            reset_at_ms: now.saturating_add(limits.window_ms),
            burst_state: None,
            fallback: true,
        }
    }

    /// Hourly totals, allowed/blocked split and per-identifier counts, on every
    /// path. Written in the background; failures are logged and dropped.
    fn record_usage(&self, identifier: &str, allowed: bool, now: u64) {
        let hour = hour_bucket(now);
        let increments = vec![
            StatIncrement::new(stats_key(hour), "total"),
            StatIncrement::new(stats_key(hour), if allowed { "allowed" } else { "blocked" }),
            StatIncrement::new(stats_users_key(hour), identifier),
        ];
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let limit = self.config.store_timeout;
        tokio::spawn(async move {
            let result = run_bounded(&metrics, limit, "increment_stats", async {
                store.increment_stats(&increments, STATS_TTL_SECS).await
            })
            .await;
            if let Err(e) = result {
                debug!(error = %e, "Failed to record usage statistics");
            }
        });
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        run_bounded(&self.metrics, self.config.store_timeout, operation, fut).await
    }
}

/// Run a store interaction under `limit`, timing and counting it
async fn run_bounded<T, F>(
    metrics: &Metrics,
    limit: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let result = match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RateLimitError::Timeout(limit)),
    };
    metrics.record_store_operation_duration(operation, started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        if !matches!(e, RateLimitError::StoreUnavailable(_)) {
            metrics.record_store_error(operation);
        }
    }
    result
}
