use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::store::StoreStats;

/// Process-lifetime counters, shared by ingestion, the registry and the
/// request-timing middleware.
#[derive(Debug, Default)]
pub struct Metrics {
    webhook_requests_total: AtomicU64,
    endpoints_created_total: AtomicU64,
    live_deliveries_dropped_total: AtomicU64,
    request_duration_micros_sum: AtomicU64,
    request_duration_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub webhook_requests_total: u64,
    pub endpoints_created_total: u64,
    pub live_deliveries_dropped_total: u64,
    pub avg_request_duration_ms: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn webhook_captured(&self) {
        self.webhook_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn endpoint_created(&self) {
        self.endpoints_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_delivery_dropped(&self) {
        self.live_deliveries_dropped_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_request(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.request_duration_micros_sum
            .fetch_add(micros, Ordering::Relaxed);
        self.request_duration_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.request_duration_count.load(Ordering::Relaxed);
        let sum = self.request_duration_micros_sum.load(Ordering::Relaxed);
        let avg_request_duration_ms = if count > 0 {
            sum as f64 / count as f64 / 1000.0
        } else {
            0.0
        };
        MetricsSnapshot {
            webhook_requests_total: self.webhook_requests_total.load(Ordering::Relaxed),
            endpoints_created_total: self.endpoints_created_total.load(Ordering::Relaxed),
            live_deliveries_dropped_total: self
                .live_deliveries_dropped_total
                .load(Ordering::Relaxed),
            avg_request_duration_ms,
        }
    }

    /// Prometheus text exposition.
    pub fn render(&self, stats: StoreStats, live_connections: usize) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}\n");
        };
        metric(
            "webhook_requests_total",
            "counter",
            "Total number of webhook requests",
            snap.webhook_requests_total.to_string(),
        );
        metric(
            "endpoints_created_total",
            "counter",
            "Total number of endpoints created",
            snap.endpoints_created_total.to_string(),
        );
        metric(
            "http_request_duration_ms",
            "gauge",
            "Average HTTP request duration",
            format!("{:.3}", snap.avg_request_duration_ms),
        );
        metric(
            "active_endpoints",
            "gauge",
            "Current number of active endpoints",
            stats.endpoints.to_string(),
        );
        metric(
            "total_webhooks_received",
            "gauge",
            "Total webhooks received",
            stats.events.to_string(),
        );
        metric(
            "live_connections",
            "gauge",
            "Currently connected live viewers",
            live_connections.to_string(),
        );
        metric(
            "live_deliveries_dropped_total",
            "counter",
            "Live pushes dropped because a viewer queue was full",
            snap.live_deliveries_dropped_total.to_string(),
        );
        out
    }
}
