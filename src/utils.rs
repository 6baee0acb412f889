use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Prefix shared by every sliding-window counter key
pub const KEY_PREFIX: &str = "ratelimit";

/// Action used when the caller does not name one
pub const DEFAULT_ACTION: &str = "default";

pub const MILLIS_PER_HOUR: u64 = 3_600_000;

/// Shortest period a background loop may tick at
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Source of wall-clock time in epoch milliseconds.
///
/// Window scores written to the shared store are epoch millis, so every
/// instance must agree on the clock's origin; only the rate of progress
/// may be faked in tests.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Clock backed by `SystemTime`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Build the counter key for an identifier and action: `ratelimit:<identifier>:<action>`
pub fn generate_limiter_key(identifier: &str, action: Option<&str>) -> String {
    format!(
        "{}:{}:{}",
        KEY_PREFIX,
        identifier,
        action.unwrap_or(DEFAULT_ACTION)
    )
}

/// Sorted-set member for one admitted request: `<now>:<12 hex chars>`
pub fn window_member(now_millis: u64) -> String {
    let suffix: [u8; 6] = rand::thread_rng().gen();
    let mut member = format!("{}:", now_millis);
    for byte in suffix {
        member.push_str(&format!("{:02x}", byte));
    }
    member
}

/// Key expiry for a window, in whole seconds, rounded up and never zero
pub fn window_ttl_secs(window_millis: u64) -> u64 {
    window_millis.div_ceil(1000).max(1)
}

/// Hour index used to bucket usage statistics
pub fn hour_bucket(now_millis: u64) -> u64 {
    now_millis / MILLIS_PER_HOUR
}

pub fn stats_key(hour: u64) -> String {
    format!("stats:{}", hour)
}

pub fn stats_users_key(hour: u64) -> String {
    format!("stats:{}:users", hour)
}

pub fn node_key(node_id: &str) -> String {
    format!("node:{}", node_id)
}

/// Random node identifier, `node-` followed by 16 hex chars
pub fn generate_node_id() -> String {
    format!("node-{:016x}", rand::thread_rng().gen::<u64>())
}

pub fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Interval for a background loop. Periods below `MIN_TICK`, including zero,
/// are raised to it; late ticks are delayed rather than bunched.
pub fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// A spawned background loop paired with its stop signal.
///
/// `stop` consumes the handle, so a task can only be stopped once. Dropping the
/// handle without stopping also closes the signal and the loop exits on its own.
pub struct TaskHandle {
    name: &'static str,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `body` on the current runtime. The receiver resolves when the task
    /// should wind down.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(body(stop_rx));
        debug!(task = name, "Background task started");
        Self {
            name,
            stop: Some(stop),
            task,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task and wait for it to finish its final iteration
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.task).await {
            Ok(()) => debug!(task = self.name, "Background task stopped"),
            Err(e) => warn!(task = self.name, error = %e, "Background task ended abnormally"),
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_key_generation() {
        assert_eq!(generate_limiter_key("10.0.0.1", None), "ratelimit:10.0.0.1:default");
        assert_eq!(
            generate_limiter_key("api-key-7", Some("upload")),
            "ratelimit:api-key-7:upload"
        );
    }

    #[test]
    fn test_window_member_is_unique_within_a_millisecond() {
        let a = window_member(1_700_000_000_000);
        let b = window_member(1_700_000_000_000);
        assert!(a.starts_with("1700000000000:"));
        assert_eq!(a.len(), "1700000000000:".len() + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_window_ttl_rounds_up() {
        assert_eq!(window_ttl_secs(1000), 1);
        assert_eq!(window_ttl_secs(1001), 2);
        assert_eq!(window_ttl_secs(60_000), 60);
        assert_eq!(window_ttl_secs(1), 1);
    }

    #[test]
    fn test_hour_bucket_keys() {
        let hour = hour_bucket(7_200_000 + 59);
        assert_eq!(hour, 2);
        assert_eq!(stats_key(hour), "stats:2");
        assert_eq!(stats_users_key(hour), "stats:2:users");
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        other.advance(500);
        assert_eq!(clock.now_millis(), 1_500);
        clock.set(10);
        assert_eq!(other.now_millis(), 10);
    }

    #[test]
    fn test_node_id_format() {
        let id = generate_node_id();
        assert!(id.starts_with("node-"));
        assert_eq!(id.len(), 21);
    }

    #[tokio::test]
    async fn test_task_handle_stops_loop() {
        let handle = TaskHandle::spawn("ticker", |mut stop| async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stop => break,
                }
            }
        });
        assert_eq!(handle.name(), "ticker");
        assert!(!handle.is_finished());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_zero_period_ticker_is_clamped() {
        let mut zero = ticker(Duration::ZERO);
        assert_eq!(zero.period(), MIN_TICK);
        zero.tick().await;
        zero.tick().await;

        assert_eq!(ticker(Duration::from_secs(5)).period(), Duration::from_secs(5));
    }
}
