//! Active health checker.
//!
//! Periodically probes every backend with a TCP connect and flips its
//! liveness flag in the pool.

use crate::backend::{Backend, BackendPool};
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Active health checker that probes backend servers.
pub struct HealthChecker {
    /// Pool whose backends are probed and updated.
    pool: Arc<BackendPool>,
    /// Time between probing rounds.
    interval: Duration,
    /// Timeout for a single probe.
    timeout: Duration,
    /// Metrics collector.
    metrics: MetricsCollector,
}

/// Outcome of probing one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// The probed backend's URL.
    pub backend: String,
    /// Whether the probe connected.
    pub alive: bool,
    /// Whether this probe changed the backend's liveness.
    pub changed: bool,
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new(pool: Arc<BackendPool>, config: &HealthCheckConfig, metrics: MetricsCollector) -> Self {
        Self {
            pool,
            interval: config.interval,
            timeout: config.timeout,
            metrics,
        }
    }

    /// Run probing rounds until shutdown.
    ///
    /// The first round fires one full interval after start; backends begin
    /// alive and are trusted until then.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            backends = self.pool.len(),
            interval = ?self.interval,
            timeout = ?self.timeout,
            "health checker starting"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_all().await;
                }

                _ = shutdown.recv() => {
                    info!("health checker shutting down");
                    break;
                }
            }
        }
    }

    /// Probe every backend once, concurrently, and apply the results.
    ///
    /// Each probe is bounded by the probe timeout, so one unreachable
    /// backend cannot hold up the rest of the round.
    pub async fn probe_all(&self) -> Vec<ProbeOutcome> {
        debug!("starting health check round");

        let probes = self
            .pool
            .backends()
            .iter()
            .map(|backend| self.probe_backend(backend));
        let outcomes = join_all(probes).await;

        info!(
            alive = self.pool.alive_count(),
            total = self.pool.len(),
            "health check round done"
        );

        outcomes
    }

    async fn probe_backend(&self, backend: &Backend) -> ProbeOutcome {
        let name = backend.to_string();
        let result = tcp_health_check(backend.connect_addr(), self.timeout).await;
        let alive = result.is_ok();
        let was_alive = backend.set_alive(alive);

        self.metrics.record_health_check(&name, alive);
        self.metrics.set_backend_alive(&name, alive);

        match (result, was_alive) {
            (Ok(()), false) => info!(backend = %name, status = "UP", "backend came back up"),
            (Err(e), true) => warn!(backend = %name, status = "DOWN", error = %e, "backend went down"),
            (Ok(()), true) => debug!(backend = %name, status = "UP", "health check"),
            (Err(e), false) => debug!(backend = %name, status = "DOWN", error = %e, "health check"),
        }

        ProbeOutcome {
            backend: name,
            alive,
            changed: was_alive != alive,
        }
    }
}

/// Perform a TCP health check: connect, then drop the connection.
async fn tcp_health_check(addr: &str, check_timeout: Duration) -> Result<(), String> {
    match timeout(check_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("connection failed: {}", e)),
        Err(_) => Err("connection timeout".to_string()),
    }
}
