//! rrproxy - a round-robin HTTP reverse-proxy load balancer
//!
//! Usage:
//!     rrproxy --backends http://localhost:3031,http://localhost:3032 --port 3030
//!     rrproxy --config rrproxy.yaml
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use rrproxy::backend::BackendPool;
use rrproxy::config::{check_config, read_config, Config};
use rrproxy::frontend::FrontendListener;
use rrproxy::health::HealthChecker;
use rrproxy::metrics::{MetricsCollector, MetricsServer};
use rrproxy::proxy::{DispatchLimits, Dispatcher, HttpForwarder};
use rrproxy::util::{init_logging, ShutdownSignal};

/// A round-robin HTTP reverse-proxy load balancer.
#[derive(Parser, Debug)]
#[command(name = "rrproxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backends attached to the load balancer, separated by commas
    #[arg(short, long, value_name = "URLS")]
    backends: Option<String>,

    /// Port to serve on
    #[arg(short, long)]
    port: Option<u16>,

    /// Optional YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

impl Cli {
    /// Assemble the configuration: file values first, then flags on top.
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => read_config(path).with_context(|| {
                format!("failed to load configuration from '{}'", path.display())
            })?,
            None => Config::default(),
        };

        if let Some(backends) = &self.backends {
            config.set_backend_list(backends);
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(level) = self.log_level {
            config.global.log_level = level;
        }

        check_config(config).context("invalid configuration")
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let validate_only = cli.validate;

    let config = cli.into_config()?;

    init_logging(&config.global.log_level, &config.global.log_format);

    if validate_only {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.listen.socket_addr());
        println!("  Backends: {}", config.backends.len());
        for backend in &config.backends {
            println!("    - {}", backend);
        }
        return Ok(());
    }

    info!(
        listen = %config.listen.socket_addr(),
        backends = config.backends.len(),
        "rrproxy starting"
    );

    run(config)
}

/// Run the load balancer with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

/// Async entry point for the load balancer.
async fn run_async(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let metrics = MetricsCollector::new();

    let pool = Arc::new(
        BackendPool::from_urls(&config.backends).context("failed to build backend pool")?,
    );
    for backend in pool.backends() {
        info!(backend = %backend, "configured backend");
        metrics.set_backend_alive(&backend.to_string(), backend.is_alive());
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&pool),
        HttpForwarder::new(config.dispatch.connect_timeout),
        DispatchLimits::from(&config.dispatch),
        metrics.clone(),
    ));

    let listen = config.listen.socket_addr();
    let listener = FrontendListener::bind(listen, dispatcher, metrics.clone())
        .await
        .with_context(|| format!("failed to bind listener on {}", listen))?;

    let mut handles = Vec::new();

    if config.global.metrics.enabled {
        let metrics_config = &config.global.metrics;
        let server = MetricsServer::bind(
            metrics_config.address,
            metrics_config.path.clone(),
            metrics.clone(),
        )
        .await
        .with_context(|| format!("failed to bind metrics server on {}", metrics_config.address))?;
        handles.push(tokio::spawn(server.run(shutdown.subscribe())));
    }

    let checker = HealthChecker::new(Arc::clone(&pool), &config.health_check, metrics);
    handles.push(tokio::spawn(checker.run(shutdown.subscribe())));
    handles.push(tokio::spawn(listener.run(shutdown.subscribe())));

    info!(listen = %listen, "load balancer started");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    shutdown.shutdown();

    for handle in handles {
        let _ = handle.await;
    }

    info!("rrproxy shut down complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_flags_only() {
        let cli = Cli::parse_from([
            "rrproxy",
            "--backends",
            "http://localhost:3031,http://localhost:3032",
            "--port",
            "8080",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.listen.port, 8080);
    }

    #[test]
    fn test_missing_backends_is_fatal() {
        let cli = Cli::parse_from(["rrproxy", "--port", "8080"]);
        let err = cli.into_config().unwrap_err();
        assert!(format!("{:#}", err).contains("at least one backend"));
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            b"listen:\n  port: 4000\nbackends:\n  - \"http://localhost:3031\"\n",
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::parse_from(["rrproxy", "--config", &path]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.listen.port, 4000);
        assert_eq!(config.backends, vec!["http://localhost:3031"]);

        let cli = Cli::parse_from([
            "rrproxy",
            "--config",
            &path,
            "--port",
            "5000",
            "--backends",
            "http://localhost:4001",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.listen.port, 5000);
        assert_eq!(config.backends, vec!["http://localhost:4001"]);
    }
}
