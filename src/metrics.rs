use prometheus::{CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Process-local metrics for the admission engine
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    checks: CounterVec,
    decisions: CounterVec,
    check_duration: Histogram,

    // Store metrics
    store_errors: CounterVec,
    store_operation_duration: HistogramVec,

    // Liveness and fallback
    heartbeats: CounterVec,
    fallback_keys: Gauge,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let checks = CounterVec::new(
            Opts::new(
                "slidegate_checks_total",
                "Admission checks by the path that produced the decision",
            ),
            &["path"],
        )?;

        let decisions = CounterVec::new(
            Opts::new("slidegate_decisions_total", "Admission decisions by outcome"),
            &["outcome"],
        )?;

        let check_duration = Histogram::with_opts(HistogramOpts::new(
            "slidegate_check_duration_seconds",
            "Duration of admission checks in seconds",
        ))?;

        let store_errors = CounterVec::new(
            Opts::new(
                "slidegate_store_errors_total",
                "Failed or timed out counter store operations",
            ),
            &["operation"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "slidegate_store_operation_duration_seconds",
                "Duration of counter store operations in seconds",
            ),
            &["operation"],
        )?;

        let heartbeats = CounterVec::new(
            Opts::new("slidegate_heartbeats_total", "Heartbeat attempts by result"),
            &["result"],
        )?;

        let fallback_keys = Gauge::new(
            "slidegate_fallback_keys",
            "Keys currently held by the local fallback cache",
        )?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(fallback_keys.clone()))?;

        Ok(Self {
            registry,
            checks,
            decisions,
            check_duration,
            store_errors,
            store_operation_duration,
            heartbeats,
            fallback_keys,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record which path served a check: `store` or `fallback`
    pub fn record_check(&self, path: &str) {
        self.checks.with_label_values(&[path]).inc();
    }

    pub fn record_decision(&self, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "blocked" };
        self.decisions.with_label_values(&[outcome]).inc();
    }

    pub fn record_store_error(&self, operation: &str) {
        self.store_errors.with_label_values(&[operation]).inc();
    }

    pub fn record_store_operation_duration(&self, operation: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Record a heartbeat attempt: `published`, `skipped` or `failed`
    pub fn record_heartbeat(&self, result: &str) {
        self.heartbeats.with_label_values(&[result]).inc();
    }

    pub fn set_fallback_keys(&self, count: usize) {
        self.fallback_keys.set(count as f64);
    }

    /// Create a timer for measuring check duration
    pub fn start_check_timer(&self) -> prometheus::HistogramTimer {
        self.check_duration.start_timer()
    }

    /// Value of a labelled counter, for assertions and the admin surface
    pub fn decision_count(&self, allowed: bool) -> u64 {
        let outcome = if allowed { "allowed" } else { "blocked" };
        self.decisions.with_label_values(&[outcome]).get() as u64
    }

    pub fn check_count(&self, path: &str) -> u64 {
        self.checks.with_label_values(&[path]).get() as u64
    }

    pub fn heartbeat_count(&self, result: &str) -> u64 {
        self.heartbeats.with_label_values(&[result]).get() as u64
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
