//! Prometheus metrics using the prometheus-client crate.
//!
//! [`SheetmuxMetrics`] registers every metric the proxy exports. The admin
//! server encodes the registry on `/metrics` in OpenMetrics text format.
//!
//! Counter names are registered without the `_total` suffix; the encoder
//! appends it.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for call counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CallLabels {
    /// Transport the call arrived on: "single_shot", "streamed", "persistent"
    pub transport: String,
    /// "success", "accepted", or a `SessionError` type name
    pub outcome: String,
}

/// Labels for call duration histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransportLabels {
    pub transport: String,
}

/// Labels for eviction counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EvictionLabels {
    /// Why the session left the table (e.g., "idle", "crashed", "explicit")
    pub reason: String,
}

/// Call latency buckets in milliseconds. Spreadsheet tools can take a while.
const CALL_DURATION_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0, 120000.0,
];

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// All proxy metrics.
pub struct SheetmuxMetrics {
    /// Sessions currently holding a live child.
    pub sessions_active: Gauge,

    /// Children spawned successfully.
    pub sessions_spawned_total: Counter,

    /// Children that failed to start.
    pub spawn_failures_total: Counter,

    /// Sessions removed from the table, by reason.
    pub sessions_evicted_total: Family<EvictionLabels, Counter>,

    /// Calls dispatched, by transport and outcome.
    pub calls_total: Family<CallLabels, Counter>,

    /// End-to-end call latency in milliseconds.
    pub call_duration_ms: Family<TransportLabels, Histogram>,

    /// Process uptime in seconds.
    pub uptime_seconds: Gauge,
}

impl SheetmuxMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let sessions_active = Gauge::default();
        registry.register(
            "sheetmux_sessions_active",
            "Sessions currently holding a live child process",
            sessions_active.clone(),
        );

        let sessions_spawned_total = Counter::default();
        registry.register(
            "sheetmux_sessions_spawned",
            "Child processes spawned for sessions",
            sessions_spawned_total.clone(),
        );

        let spawn_failures_total = Counter::default();
        registry.register(
            "sheetmux_spawn_failures",
            "Child processes that failed to start",
            spawn_failures_total.clone(),
        );

        let sessions_evicted_total = Family::<EvictionLabels, Counter>::default();
        registry.register(
            "sheetmux_sessions_evicted",
            "Sessions removed from the table by reason",
            sessions_evicted_total.clone(),
        );

        let calls_total = Family::<CallLabels, Counter>::default();
        registry.register(
            "sheetmux_calls",
            "Calls dispatched by transport and outcome",
            calls_total.clone(),
        );

        let call_duration_ms = Family::<TransportLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(CALL_DURATION_BUCKETS.iter().copied())
        });
        registry.register(
            "sheetmux_call_duration_ms",
            "End-to-end call latency in milliseconds",
            call_duration_ms.clone(),
        );

        let uptime_seconds = Gauge::default();
        registry.register(
            "sheetmux_uptime_seconds",
            "Process uptime in seconds",
            uptime_seconds.clone(),
        );

        Self {
            sessions_active,
            sessions_spawned_total,
            spawn_failures_total,
            sessions_evicted_total,
            calls_total,
            call_duration_ms,
            uptime_seconds,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience Methods
    // ─────────────────────────────────────────────────────────────────────────

    pub fn record_spawn(&self) {
        self.sessions_spawned_total.inc();
        self.sessions_active.inc();
    }

    pub fn record_spawn_failure(&self) {
        self.spawn_failures_total.inc();
    }

    pub fn record_eviction(&self, reason: &str) {
        self.sessions_active.dec();
        self.sessions_evicted_total
            .get_or_create(&EvictionLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    /// Record one dispatched call.
    ///
    /// * `transport` - "single_shot", "streamed" or "persistent"
    /// * `outcome` - "success", "accepted", or an error type name
    pub fn record_call(&self, transport: &str, outcome: &str, duration_ms: f64) {
        self.calls_total
            .get_or_create(&CallLabels {
                transport: transport.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.call_duration_ms
            .get_or_create(&TransportLabels {
                transport: transport.to_string(),
            })
            .observe(duration_ms);
    }
}
