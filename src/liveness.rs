//! Node liveness: periodic heartbeats into the shared store and peer status queries.
//!
//! A node only ever writes its own record. Peers are presumed dead once their
//! record carries `status: shutdown` or has expired.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::{
    metrics::Metrics,
    ring::HashRing,
    store::{CounterStore, NodeHealthRecord, NodeStatus},
    utils::{ticker, Clock, TaskHandle},
};

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    /// Lifetime of the node record after each heartbeat, in seconds
    pub ttl_secs: u64,
    /// Upper bound on the final shutdown write
    pub shutdown_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            ttl_secs: 30,
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

/// Where this node is in its own lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unknown,
    Active,
    ShuttingDown,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => NodeState::Active,
            2 => NodeState::ShuttingDown,
            _ => NodeState::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            NodeState::Unknown => 0,
            NodeState::Active => 1,
            NodeState::ShuttingDown => 2,
        }
    }
}

pub struct NodeLivenessTracker {
    node_id: String,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    config: LivenessConfig,
    state: AtomicU8,
}

impl NodeLivenessTracker {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        config: LivenessConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            clock,
            metrics,
            config,
            state: AtomicU8::new(NodeState::Unknown.as_u8()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Publish one heartbeat if the store is reachable. Returns whether it was written.
    ///
    /// Failures are skipped, not retried; the next tick tries again.
    pub async fn heartbeat(&self) -> bool {
        if self.state() == NodeState::ShuttingDown {
            return false;
        }

        let now = self.clock.now_millis();
        let attempt = async {
            if !self.store.is_ready().await {
                return Ok(false);
            }
            self.store
                .publish_heartbeat(&self.node_id, now, self.config.ttl_secs)
                .await
                .map(|_| true)
        };

        match timeout(self.config.heartbeat_interval, attempt).await {
            Ok(Ok(true)) => {
                // A shutdown that raced this write keeps its state.
                let _ = self.state.compare_exchange(
                    NodeState::Unknown.as_u8(),
                    NodeState::Active.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                self.metrics.record_heartbeat("published");
                true
            }
            Ok(Ok(false)) => {
                debug!(node_id = %self.node_id, "Heartbeat skipped - store unavailable");
                self.metrics.record_heartbeat("skipped");
                false
            }
            Ok(Err(e)) => {
                debug!(node_id = %self.node_id, error = %e, "Heartbeat failed");
                self.metrics.record_heartbeat("failed");
                false
            }
            Err(_) => {
                debug!(node_id = %self.node_id, "Heartbeat timed out");
                self.metrics.record_heartbeat("failed");
                false
            }
        }
    }

    /// Best-effort `status: shutdown` write, bounded by `shutdown_timeout`.
    /// Stops any further heartbeats whether or not the write lands.
    pub async fn announce_shutdown(&self) -> bool {
        self.state
            .store(NodeState::ShuttingDown.as_u8(), Ordering::SeqCst);

        let attempt = async {
            if !self.store.is_ready().await {
                return Ok(false);
            }
            self.store
                .mark_shutdown(&self.node_id, self.config.ttl_secs)
                .await
                .map(|_| true)
        };

        match timeout(self.config.shutdown_timeout, attempt).await {
            Ok(Ok(true)) => {
                info!(node_id = %self.node_id, "Node marked as shut down");
                true
            }
            Ok(Ok(false)) => {
                error!(node_id = %self.node_id, "Shutdown cleanup failed: store unavailable");
                false
            }
            Ok(Err(e)) => {
                error!(node_id = %self.node_id, error = %e, "Shutdown cleanup failed");
                false
            }
            Err(_) => {
                error!(node_id = %self.node_id, "Shutdown cleanup timed out");
                false
            }
        }
    }

    /// Health record currently published by `node_id`. Store errors read as absent.
    pub async fn node_status(&self, node_id: &str) -> Option<NodeHealthRecord> {
        match timeout(self.config.heartbeat_interval, self.store.node_health(node_id)).await {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                debug!(node_id, error = %e, "Node status query failed");
                None
            }
            Err(_) => None,
        }
    }

    /// This node counts as alive until it starts shutting down; others need an active record.
    pub async fn is_alive(&self, node_id: &str) -> bool {
        if node_id == self.node_id {
            return self.state() != NodeState::ShuttingDown;
        }
        matches!(
            self.node_status(node_id).await,
            Some(NodeHealthRecord {
                status: NodeStatus::Active,
                ..
            })
        )
    }

    /// The subset of `candidates` currently alive, in input order
    pub async fn live_members(&self, candidates: &[String]) -> Vec<String> {
        let mut live = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.is_alive(candidate).await {
                live.push(candidate.clone());
            }
        }
        live
    }

    /// Make the ring's membership match the live subset of `candidates`.
    /// Members not among the candidates are removed too. Returns the member count.
    pub async fn sync_ring(&self, ring: &mut HashRing, candidates: &[String]) -> usize {
        let live = self.live_members(candidates).await;
        for member in ring.members() {
            if !live.contains(&member) {
                info!(node_id = %member, "Removing node from hash ring");
                ring.remove_member(&member);
            }
        }
        for member in &live {
            if !ring.contains(member) {
                info!(node_id = %member, "Adding node to hash ring");
                ring.add_member(member);
            }
        }
        ring.member_count()
    }

    /// Heartbeat every `heartbeat_interval` until stopped, then announce shutdown
    pub fn start(self: &Arc<Self>) -> TaskHandle {
        let tracker = Arc::clone(self);
        TaskHandle::spawn("heartbeat", move |mut stop| async move {
            let mut ticker = ticker(tracker.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.heartbeat().await;
                    }
                    _ = &mut stop => break,
                }
            }
            tracker.announce_shutdown().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryStore, utils::ManualClock};

    fn tracker_with(
        node_id: &str,
        store: Arc<MemoryStore>,
        clock: &ManualClock,
    ) -> (Arc<Metrics>, NodeLivenessTracker) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let tracker = NodeLivenessTracker::new(
            node_id,
            store,
            Arc::new(clock.clone()),
            Arc::clone(&metrics),
            LivenessConfig {
                heartbeat_interval: Duration::from_millis(20),
                ttl_secs: 30,
                shutdown_timeout: Duration::from_millis(50),
            },
        );
        (metrics, tracker)
    }

    #[tokio::test]
    async fn test_heartbeat_publishes_active_record() {
        let clock = ManualClock::new(100_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let (metrics, tracker) = tracker_with("n1", store.clone(), &clock);

        assert_eq!(tracker.state(), NodeState::Unknown);
        assert!(tracker.heartbeat().await);
        assert_eq!(tracker.state(), NodeState::Active);
        assert_eq!(metrics.heartbeat_count("published"), 1);

        let record = store.node_health("n1").await.unwrap().unwrap();
        assert_eq!(record.status, NodeStatus::Active);
        assert_eq!(record.last_heartbeat_ms, Some(100_000));
        assert_eq!(store.ttl_millis("node:n1").await, Some(30_000));
    }

    #[tokio::test]
    async fn test_heartbeat_skipped_when_store_down() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let (metrics, tracker) = tracker_with("n1", store.clone(), &clock);

        store.set_available(false);
        assert!(!tracker.heartbeat().await);
        assert_eq!(metrics.heartbeat_count("skipped"), 1);

        store.set_available(true);
        assert!(tracker.heartbeat().await);
    }

    #[tokio::test]
    async fn test_shutdown_stops_heartbeats() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let (_, tracker) = tracker_with("n1", store.clone(), &clock);

        tracker.heartbeat().await;
        assert!(tracker.announce_shutdown().await);
        assert_eq!(tracker.state(), NodeState::ShuttingDown);
        assert!(!tracker.heartbeat().await);

        let record = store.node_health("n1").await.unwrap().unwrap();
        assert_eq!(record.status, NodeStatus::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_write_is_bounded() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let (_, tracker) = tracker_with("n1", store.clone(), &clock);

        store.set_stalled(true);
        assert!(!tracker.announce_shutdown().await);
    }

    #[tokio::test]
    async fn test_peer_liveness_follows_records() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let (_, me) = tracker_with("me", store.clone(), &clock);
        let (_, peer) = tracker_with("peer", store.clone(), &clock);
        let (_, quitter) = tracker_with("quitter", store.clone(), &clock);

        peer.heartbeat().await;
        quitter.heartbeat().await;
        quitter.announce_shutdown().await;

        let candidates = vec![
            "me".to_string(),
            "peer".to_string(),
            "quitter".to_string(),
            "ghost".to_string(),
        ];
        assert_eq!(
            me.live_members(&candidates).await,
            vec!["me".to_string(), "peer".to_string()]
        );

        // The peer's record expires after its TTL without a refresh.
        clock.advance(30_000);
        assert!(!me.is_alive("peer").await);
    }

    #[tokio::test]
    async fn test_sync_ring() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let (_, me) = tracker_with("me", store.clone(), &clock);
        let (_, peer) = tracker_with("peer", store.clone(), &clock);
        peer.heartbeat().await;

        let mut ring = HashRing::with_members(["me", "stale"], 8);
        let candidates = vec!["me".to_string(), "peer".to_string()];
        assert_eq!(me.sync_ring(&mut ring, &candidates).await, 2);
        assert_eq!(ring.members(), vec!["me".to_string(), "peer".to_string()]);
    }

    #[tokio::test]
    async fn test_background_heartbeat_and_final_status() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let (metrics, tracker) = tracker_with("n1", store.clone(), &clock);
        let tracker = Arc::new(tracker);

        let handle = tracker.start();
        tokio::time::sleep(Duration::from_millis(70)).await;
        handle.stop().await;

        assert!(metrics.heartbeat_count("published") >= 2);
        let record = store.node_health("n1").await.unwrap().unwrap();
        assert_eq!(record.status, NodeStatus::Shutdown);
        assert_eq!(tracker.state(), NodeState::ShuttingDown);
    }
}
