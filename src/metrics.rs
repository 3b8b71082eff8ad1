//! Metrics collection
//!
//! Process-scoped counters for the webhook pipeline and the credit ledger,
//! plus an HdrHistogram of request latencies. One [`Metrics`] is built at
//! startup and handed to whoever records into it; there is no global
//! instance.
//!
//! Exported in Prometheus text format on `GET /metrics`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const PREFIX: &str = "leadflow";

// ============================================================================
// Latency Histogram
// ============================================================================

/// Request latency percentiles, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub total_requests: u64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

/// Thread-safe latency histogram.
///
/// Tracks 1us to 60s with 3 significant figures.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: RwLock<Histogram<u64>>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let histogram =
            Histogram::new_with_bounds(1, 60_000_000, 3).expect("Failed to create histogram");
        Self {
            inner: RwLock::new(histogram),
        }
    }

    /// Record a duration. Values outside the bounds are saturated.
    pub fn record(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let mut hist = self.inner.write();
        hist.saturating_record(micros.max(1));
    }

    pub fn count(&self) -> u64 {
        self.inner.read().len()
    }

    /// Percentiles converted to milliseconds
    pub fn metrics(&self) -> LatencyMetrics {
        let hist = self.inner.read();
        LatencyMetrics {
            p50_ms: hist.value_at_percentile(50.0) as f64 / 1000.0,
            p95_ms: hist.value_at_percentile(95.0) as f64 / 1000.0,
            p99_ms: hist.value_at_percentile(99.0) as f64 / 1000.0,
            total_requests: hist.len(),
            mean_ms: hist.mean() / 1000.0,
            max_ms: hist.max() as f64 / 1000.0,
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// How an inbound webhook ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Matched,
    Unmatched,
    Duplicate,
    /// Bad signature or unreadable payload; nothing stored
    Rejected,
    /// Store failure while ingesting
    Error,
}

/// How a metered action ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    Insufficient,
    RolledBack,
    RollbackFailed,
    StoreUnavailable,
}

/// Process-wide metrics, constructed once and shared by `Arc`
#[derive(Debug)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub webhooks_received: AtomicU64,
    pub webhooks_matched: AtomicU64,
    pub webhooks_unmatched: AtomicU64,
    pub webhooks_duplicate: AtomicU64,
    pub webhooks_rejected: AtomicU64,
    pub webhooks_errors: AtomicU64,
    pub actions_succeeded: AtomicU64,
    pub actions_insufficient: AtomicU64,
    pub actions_rolled_back: AtomicU64,
    pub rollback_failures: AtomicU64,
    pub store_unavailable: AtomicU64,
    pub credits_granted: AtomicU64,

    /// Requests by (route, status)
    requests_by_route: RwLock<BTreeMap<(String, u16), u64>>,
    latency: LatencyHistogram,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            webhooks_received: AtomicU64::new(0),
            webhooks_matched: AtomicU64::new(0),
            webhooks_unmatched: AtomicU64::new(0),
            webhooks_duplicate: AtomicU64::new(0),
            webhooks_rejected: AtomicU64::new(0),
            webhooks_errors: AtomicU64::new(0),
            actions_succeeded: AtomicU64::new(0),
            actions_insufficient: AtomicU64::new(0),
            actions_rolled_back: AtomicU64::new(0),
            rollback_failures: AtomicU64::new(0),
            store_unavailable: AtomicU64::new(0),
            credits_granted: AtomicU64::new(0),
            requests_by_route: RwLock::new(BTreeMap::new()),
            latency: LatencyHistogram::new(),
            start_time: Instant::now(),
        }
    }

    /// Record an HTTP request with timing information
    pub fn record_request(&self, route: &str, status_code: u16, duration: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.latency.record(duration);
        *self
            .requests_by_route
            .write()
            .entry((route.to_string(), status_code))
            .or_insert(0) += 1;
    }

    pub fn record_webhook(&self, outcome: WebhookOutcome) {
        self.webhooks_received.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            WebhookOutcome::Matched => &self.webhooks_matched,
            WebhookOutcome::Unmatched => &self.webhooks_unmatched,
            WebhookOutcome::Duplicate => &self.webhooks_duplicate,
            WebhookOutcome::Rejected => &self.webhooks_rejected,
            WebhookOutcome::Error => &self.webhooks_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_action(&self, outcome: ActionOutcome) {
        let counter = match outcome {
            ActionOutcome::Succeeded => &self.actions_succeeded,
            ActionOutcome::Insufficient => &self.actions_insufficient,
            ActionOutcome::RolledBack => &self.actions_rolled_back,
            ActionOutcome::RollbackFailed => &self.rollback_failures,
            ActionOutcome::StoreUnavailable => &self.store_unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grant(&self) {
        self.credits_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn latency(&self) -> LatencyMetrics {
        self.latency.metrics()
    }

    /// Convert metrics to Prometheus text format
    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &AtomicU64); 13] = [
            ("requests_total", &self.requests_total),
            ("webhooks_received_total", &self.webhooks_received),
            ("webhooks_matched_total", &self.webhooks_matched),
            ("webhooks_unmatched_total", &self.webhooks_unmatched),
            ("webhooks_duplicate_total", &self.webhooks_duplicate),
            ("webhooks_rejected_total", &self.webhooks_rejected),
            ("webhooks_errors_total", &self.webhooks_errors),
            ("actions_succeeded_total", &self.actions_succeeded),
            ("actions_insufficient_total", &self.actions_insufficient),
            ("actions_rolled_back_total", &self.actions_rolled_back),
            ("rollback_failures_total", &self.rollback_failures),
            ("store_unavailable_total", &self.store_unavailable),
            ("credits_granted_total", &self.credits_granted),
        ];
        for (name, value) in counters {
            output.push_str(&format!("# TYPE {PREFIX}_{name} counter\n"));
            output.push_str(&format!(
                "{PREFIX}_{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }

        output.push_str(&format!("# TYPE {PREFIX}_requests_by_route counter\n"));
        for ((route, status), count) in self.requests_by_route.read().iter() {
            output.push_str(&format!(
                "{PREFIX}_requests_by_route{{route=\"{route}\",status=\"{status}\"}} {count}\n"
            ));
        }

        if self.latency.count() > 0 {
            let latency = self.latency.metrics();
            output.push_str(&format!("{PREFIX}_request_duration_p50_ms {}\n", latency.p50_ms));
            output.push_str(&format!("{PREFIX}_request_duration_p95_ms {}\n", latency.p95_ms));
            output.push_str(&format!("{PREFIX}_request_duration_p99_ms {}\n", latency.p99_ms));
        }

        output.push_str(&format!(
            "{PREFIX}_uptime_seconds {}\n",
            self.uptime_seconds()
        ));
        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
