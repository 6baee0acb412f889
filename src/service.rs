use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    cache::LocalFallbackCache,
    config::Settings,
    limiter::{CheckOptions, Decision, RateLimitEngine, StatusReport},
    liveness::NodeLivenessTracker,
    metrics::Metrics,
    ring::HashRing,
    store::CounterStore,
    utils::{ticker, Clock, TaskHandle},
};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_USED: &str = "x-ratelimit-used";

/// Response headers describing a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds
    pub reset_ms: u64,
    pub used: u64,
}

impl From<&Decision> for RateLimitHeaders {
    fn from(decision: &Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_ms: decision.reset_at_ms,
            used: decision.current,
        }
    }
}

impl RateLimitHeaders {
    pub fn apply(&self, headers: &mut HeaderMap) {
        let pairs = [
            (HEADER_LIMIT, self.limit),
            (HEADER_REMAINING, self.remaining),
            (HEADER_RESET, self.reset_ms),
            (HEADER_USED, self.used),
        ];
        for (name, value) in pairs {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        }
    }
}

/// Owns the engine, the liveness tracker and every background task of one node
pub struct RateLimitService {
    node_id: String,
    engine: RateLimitEngine,
    tracker: Arc<NodeLivenessTracker>,
    ring: Arc<RwLock<HashRing>>,
    peers: Vec<String>,
    metrics: Arc<Metrics>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl RateLimitService {
    /// Compose a node and start its heartbeat, fallback cleanup and, when
    /// peers are configured, ring membership refresh. Must run inside a runtime.
    pub fn new(
        settings: &Settings,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let node_id = settings.node.id.clone();
        let fallback = Arc::new(LocalFallbackCache::new(settings.fallback_config()));
        let engine = RateLimitEngine::new(
            Arc::clone(&store),
            Arc::clone(&fallback),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            settings.engine_config(),
        );
        let tracker = Arc::new(NodeLivenessTracker::new(
            node_id.clone(),
            store,
            Arc::clone(&clock),
            Arc::clone(&metrics),
            settings.liveness_config(),
        ));
        let ring = Arc::new(RwLock::new(HashRing::with_members(
            [node_id.as_str()],
            settings.node.replicas,
        )));
        let peers: Vec<String> = settings
            .node
            .peers
            .iter()
            .filter(|peer| **peer != node_id)
            .cloned()
            .collect();

        let mut tasks = vec![
            tracker.start(),
            LocalFallbackCache::spawn_cleanup(fallback, clock, Arc::clone(&metrics)),
        ];
        if !peers.is_empty() {
            tasks.push(spawn_membership(
                Arc::clone(&tracker),
                Arc::clone(&ring),
                candidates(&node_id, &peers),
            ));
        }

        info!(node_id = %node_id, peers = peers.len(), "Rate limit service started");
        Self {
            node_id,
            engine,
            tracker,
            ring,
            peers,
            metrics,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn engine(&self) -> &RateLimitEngine {
        &self.engine
    }

    pub fn tracker(&self) -> &Arc<NodeLivenessTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn check(&self, identifier: &str, options: &CheckOptions) -> Decision {
        self.engine.check(identifier, options).await
    }

    pub async fn status(&self, identifier: &str, action: Option<&str>) -> StatusReport {
        self.engine.status(identifier, action).await
    }

    pub async fn reset(&self, identifier: &str, action: Option<&str>) -> bool {
        self.engine.reset(identifier, action).await
    }

    /// Re-check which of this node and its peers are alive and rebuild the ring
    pub async fn refresh_ring(&self) -> usize {
        sync_ring(
            &self.tracker,
            &self.ring,
            &candidates(&self.node_id, &self.peers),
        )
        .await
    }

    /// Node owning `identifier` on the ring. Informational; admission never consults it.
    pub async fn owner_of(&self, identifier: &str) -> Option<String> {
        self.ring.read().await.lookup(identifier).map(str::to_string)
    }

    pub async fn ring_members(&self) -> Vec<String> {
        self.ring.read().await.members()
    }

    /// Stop every background task. The heartbeat task goes last and publishes the
    /// final shutdown status. Returns false when already shut down.
    pub async fn shutdown(&self) -> bool {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return false;
        }
        info!(node_id = %self.node_id, "Shutting down rate limit service");
        for task in tasks.into_iter().rev() {
            debug!(task = task.name(), "Stopping background task");
            task.stop().await;
        }
        true
    }
}

fn candidates(node_id: &str, peers: &[String]) -> Vec<String> {
    std::iter::once(node_id.to_string())
        .chain(peers.iter().cloned())
        .collect()
}

/// Sync a copy of the ring so readers never wait on store queries
async fn sync_ring(
    tracker: &NodeLivenessTracker,
    ring: &RwLock<HashRing>,
    candidates: &[String],
) -> usize {
    let mut next = ring.read().await.clone();
    let members = tracker.sync_ring(&mut next, candidates).await;
    *ring.write().await = next;
    members
}

fn spawn_membership(
    tracker: Arc<NodeLivenessTracker>,
    ring: Arc<RwLock<HashRing>>,
    candidates: Vec<String>,
) -> TaskHandle {
    let period = tracker.config().heartbeat_interval;
    TaskHandle::spawn("ring-membership", move |mut stop| async move {
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sync_ring(&tracker, &ring, &candidates).await;
                }
                _ = &mut stop => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        limiter::BurstState,
        store::{MemoryStore, NodeStatus},
        utils::ManualClock,
    };

    fn settings(node_id: &str, peers: &[&str]) -> Settings {
        let mut settings = Settings::default();
        settings.node.id = node_id.to_string();
        settings.node.peers = peers.iter().map(|p| p.to_string()).collect();
        settings.node.heartbeat_interval_ms = 20;
        settings.node.shutdown_timeout_ms = 50;
        settings.rate_limit.store_timeout_ms = 50;
        settings
    }

    fn create_test_service(node_id: &str, peers: &[&str]) -> (Arc<MemoryStore>, ManualClock, RateLimitService) {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let service = RateLimitService::new(
            &settings(node_id, peers),
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(Metrics::new().unwrap()),
        );
        (store, clock, service)
    }

    #[test]
    fn test_headers_from_decision() {
        let decision = Decision {
            allowed: true,
            current: 3,
            limit: 10,
            burst: 1,
            remaining: 8,
            reset_at_ms: 1_700_000_000_000,
            burst_state: Some(BurstState::Available),
            fallback: false,
        };
        let mut headers = HeaderMap::new();
        RateLimitHeaders::from(&decision).apply(&mut headers);

        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-remaining"], "8");
        assert_eq!(headers["x-ratelimit-reset"], "1700000000000");
        assert_eq!(headers["x-ratelimit-used"], "3");
    }

    #[tokio::test]
    async fn test_check_status_reset() {
        let (_, _, service) = create_test_service("n1", &[]);
        let options = CheckOptions::new().with_limit(5).with_burst(0);

        service.check("alice", &options).await;
        let decision = service.check("alice", &options).await;
        assert_eq!(decision.current, 2);

        match service.status("alice", None).await {
            StatusReport::Current { current, .. } => assert_eq!(current, 2),
            other => panic!("unexpected status: {:?}", other),
        }

        assert!(service.reset("alice", None).await);
        assert_eq!(service.check("alice", &options).await.current, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_runs_once_and_marks_node() {
        let (store, _, service) = create_test_service("n1", &[]);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert!(service.shutdown().await);
        assert!(!service.shutdown().await);

        let record = store.node_health("n1").await.unwrap().unwrap();
        assert_eq!(record.status, NodeStatus::Shutdown);
    }

    #[tokio::test]
    async fn test_zero_intervals_do_not_panic_background_tasks() {
        let mut settings = settings("n1", &["n2"]);
        settings.node.heartbeat_interval_ms = 0;
        settings.fallback.cleanup_interval_ms = 0;
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let service = RateLimitService::new(
            &settings,
            store.clone(),
            Arc::new(clock),
            Arc::new(Metrics::new().unwrap()),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(service.shutdown().await);
        let record = store.node_health("n1").await.unwrap().unwrap();
        assert_eq!(record.status, NodeStatus::Shutdown);
    }

    #[tokio::test]
    async fn test_ring_tracks_live_peers() {
        let (store, clock, service) = create_test_service("n1", &["n2", "n3"]);
        assert_eq!(service.owner_of("user-42").await.as_deref(), Some("n1"));

        store.publish_heartbeat("n2", clock.now_millis(), 30).await.unwrap();
        assert_eq!(service.refresh_ring().await, 2);
        assert_eq!(service.ring_members().await, vec!["n1".to_string(), "n2".to_string()]);

        let owner = service.owner_of("user-42").await.unwrap();
        assert!(owner == "n1" || owner == "n2");

        store.mark_shutdown("n2", 30).await.unwrap();
        assert_eq!(service.refresh_ring().await, 1);
        service.shutdown().await;
    }
}
