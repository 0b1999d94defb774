//! Metrics collector using prometheus-client.
//!
//! Provides metrics for requests, retries, backend ejections, health checks
//! and backend liveness.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status: String,
}

/// Labels for per-backend metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub backend: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Requests answered, by status code.
    requests_total: Family<StatusLabels, Counter>,
    /// Request duration histogram (in seconds).
    request_duration_seconds: Histogram,
    /// Transport errors while forwarding.
    forward_errors_total: Family<BackendLabels, Counter>,
    /// Retries against the same backend.
    retries_total: Family<BackendLabels, Counter>,
    /// Backends marked down after exhausting retries.
    ejections_total: Family<BackendLabels, Counter>,
    /// Requests that ran out of attempts.
    exhausted_total: Counter,
    /// Backend liveness gauge (1 = alive, 0 = down).
    backend_alive: Family<BackendLabels, Gauge>,
    /// Health check results counter.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// Open client connections.
    active_connections: Gauge,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<StatusLabels, Counter>::default();
        // Buckets: 1ms, 2.5ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
        let request_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.5, 13));
        let forward_errors_total = Family::<BackendLabels, Counter>::default();
        let retries_total = Family::<BackendLabels, Counter>::default();
        let ejections_total = Family::<BackendLabels, Counter>::default();
        let exhausted_total = Counter::default();
        let backend_alive = Family::<BackendLabels, Gauge>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let active_connections = Gauge::default();

        registry.register(
            "rrproxy_requests",
            "Total number of requests answered",
            requests_total.clone(),
        );
        registry.register(
            "rrproxy_request_duration_seconds",
            "Request duration in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "rrproxy_forward_errors",
            "Transport errors while forwarding to a backend",
            forward_errors_total.clone(),
        );
        registry.register(
            "rrproxy_retries",
            "Retries against the same backend",
            retries_total.clone(),
        );
        registry.register(
            "rrproxy_backend_ejections",
            "Backends marked down after exhausting retries",
            ejections_total.clone(),
        );
        registry.register(
            "rrproxy_attempts_exhausted",
            "Requests that ran out of attempts",
            exhausted_total.clone(),
        );
        registry.register(
            "rrproxy_backend_alive",
            "Backend liveness (1=alive, 0=down)",
            backend_alive.clone(),
        );
        registry.register(
            "rrproxy_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );
        registry.register(
            "rrproxy_active_connections",
            "Number of open client connections",
            active_connections.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                forward_errors_total,
                retries_total,
                ejections_total,
                exhausted_total,
                backend_alive,
                health_checks_total,
                active_connections,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record an answered request.
    pub fn record_request(&self, status: u16, duration: Duration) {
        let labels = StatusLabels {
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();
        self.inner
            .request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Record a transport error from a backend.
    pub fn record_forward_error(&self, backend: &str) {
        self.inner
            .forward_errors_total
            .get_or_create(&backend_labels(backend))
            .inc();
    }

    /// Record a retry against a backend.
    pub fn record_retry(&self, backend: &str) {
        self.inner
            .retries_total
            .get_or_create(&backend_labels(backend))
            .inc();
    }

    /// Record a backend being marked down by the dispatcher.
    pub fn record_ejection(&self, backend: &str) {
        self.inner
            .ejections_total
            .get_or_create(&backend_labels(backend))
            .inc();
        self.set_backend_alive(backend, false);
    }

    /// Record a request that ran out of attempts.
    pub fn record_exhausted(&self) {
        self.inner.exhausted_total.inc();
    }

    /// Update backend liveness.
    pub fn set_backend_alive(&self, backend: &str, alive: bool) {
        self.inner
            .backend_alive
            .get_or_create(&backend_labels(backend))
            .set(if alive { 1 } else { 0 });
    }

    /// Record a health check result.
    pub fn record_health_check(&self, backend: &str, success: bool) {
        let labels = HealthCheckLabels {
            backend: backend.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Increment active connections.
    pub fn connection_opened(&self) {
        self.inner.active_connections.inc();
    }

    /// Decrement active connections.
    pub fn connection_closed(&self) {
        self.inner.active_connections.dec();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn backend_labels(backend: &str) -> BackendLabels {
    BackendLabels {
        backend: backend.to_string(),
    }
}
