//! Integration tests for rrproxy.
//!
//! These tests run the frontend listener against real local backends.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rrproxy::backend::BackendPool;
use rrproxy::config::{load_config, DispatchConfig, HealthCheckConfig};
use rrproxy::frontend::FrontendListener;
use rrproxy::health::HealthChecker;
use rrproxy::metrics::MetricsCollector;
use rrproxy::proxy::{DispatchLimits, Dispatcher, HttpForwarder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// A running HTTP backend that answers every request with its name
/// followed by the request line it received.
struct TestBackend {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestBackend {
    async fn start(name: &'static str, addr: &str) -> Self {
        let listener = TcpListener::bind(addr).await.expect("failed to bind backend");
        let addr = listener.local_addr().unwrap();
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        tokio::spawn(serve(stream, name));
                    }
                    _ = &mut stopped => break,
                }
            }
        });

        Self { addr, stop, handle }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting and release the port.
    async fn kill(self) -> SocketAddr {
        let _ = self.stop.send(());
        let _ = self.handle.await;
        self.addr
    }
}

async fn serve(mut stream: TcpStream, name: &str) {
    let mut buf = vec![0u8; 8192];
    let mut read = 0;
    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf[read..]).await {
            Ok(0) | Err(_) => return,
            Ok(n) => read += n,
        }
        if read == buf.len() {
            return;
        }
    }

    let head = String::from_utf8_lossy(&buf[..read]);
    let request_line = head.lines().next().unwrap_or_default();
    let body = format!("{} {}", name, request_line);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

/// Load balancer under test: the listener task plus handles on its pool.
struct TestBalancer {
    addr: SocketAddr,
    pool: Arc<BackendPool>,
    checker: HealthChecker,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestBalancer {
    async fn start(backends: &[String]) -> Self {
        let pool = Arc::new(BackendPool::from_urls(backends).unwrap());
        let metrics = MetricsCollector::new();

        let dispatch = DispatchConfig {
            retry_delay: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(500),
            ..DispatchConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&pool),
            HttpForwarder::new(dispatch.connect_timeout),
            DispatchLimits::from(&dispatch),
            metrics.clone(),
        ));

        let health = HealthCheckConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(200),
        };
        let checker = HealthChecker::new(Arc::clone(&pool), &health, metrics.clone());

        let listener = FrontendListener::bind("127.0.0.1:0".parse().unwrap(), dispatcher, metrics)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(rx));

        Self {
            addr,
            pool,
            checker,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

/// Send one request and return (status code, body).
async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut client = TcpStream::connect(addr).await.expect("failed to connect");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: lb.test\r\nConnection: close\r\n\r\n",
        path
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

/// Send `n` requests and count which backend answered each.
async fn spread(addr: SocketAddr, n: usize) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for _ in 0..n {
        let (status, body) = get(addr, "/").await;
        assert_eq!(status, 200, "unexpected response: {}", body);
        let name = body.split_whitespace().next().unwrap_or_default().to_string();
        *counts.entry(name).or_insert(0) += 1;
    }
    counts
}

#[tokio::test]
async fn test_round_robin_spread_and_health_recovery() {
    let b1 = TestBackend::start("b1", "127.0.0.1:0").await;
    let b2 = TestBackend::start("b2", "127.0.0.1:0").await;
    let b3 = TestBackend::start("b3", "127.0.0.1:0").await;
    let balancer = TestBalancer::start(&[b1.url(), b2.url(), b3.url()]).await;

    let counts = spread(balancer.addr, 10).await;
    for name in ["b1", "b2", "b3"] {
        let count = counts.get(name).copied().unwrap_or(0);
        assert!((3..=4).contains(&count), "{} served {} of 10", name, count);
    }

    // Take b2 down and let a probe round notice.
    let b2_addr = b2.kill().await;
    let outcomes = balancer.checker.probe_all().await;
    assert!(outcomes.iter().any(|o| !o.alive && o.changed));
    assert!(!balancer.pool.backends()[1].is_alive());

    let counts = spread(balancer.addr, 10).await;
    assert_eq!(counts.get("b2"), None);
    assert_eq!(counts.values().sum::<usize>(), 10);

    // Bring b2 back on the same port.
    let b2 = TestBackend::start("b2", &b2_addr.to_string()).await;
    balancer.checker.probe_all().await;
    assert!(balancer.pool.backends()[1].is_alive());

    let counts = spread(balancer.addr, 6).await;
    assert_eq!(counts.get("b2"), Some(&2));

    balancer.stop().await;
    for backend in [b1, b2, b3] {
        backend.kill().await;
    }
}

#[tokio::test]
async fn test_dead_backend_is_skipped_without_probe() {
    let b1 = TestBackend::start("b1", "127.0.0.1:0").await;
    let b2 = TestBackend::start("b2", "127.0.0.1:0").await;
    let b2_url = b2.url();
    b2.kill().await;

    let balancer = TestBalancer::start(&[b1.url(), b2_url]).await;

    // Every request succeeds; the dead backend is condemned by the
    // dispatcher itself on the first request routed to it.
    let counts = spread(balancer.addr, 5).await;
    assert_eq!(counts.get("b1"), Some(&5));
    assert!(!balancer.pool.backends()[1].is_alive());
    assert_eq!(balancer.pool.alive_count(), 1);

    balancer.stop().await;
    b1.kill().await;
}

#[tokio::test]
async fn test_unreachable_backend_fails_fast_with_503() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", closed.local_addr().unwrap());
    drop(closed);

    let balancer = TestBalancer::start(&[url]).await;

    let start = Instant::now();
    let (status, body) = get(balancer.addr, "/").await;
    assert_eq!(status, 503);
    assert!(body.contains("Service Unavailable"), "body: {}", body);
    assert!(start.elapsed() < Duration::from_secs(2));

    // The backend is now marked down, so the next request short-circuits.
    let (status, _) = get(balancer.addr, "/").await;
    assert_eq!(status, 503);

    balancer.stop().await;
}

#[tokio::test]
async fn test_path_and_query_reach_backend() {
    let backend = TestBackend::start("b1", "127.0.0.1:0").await;
    let balancer = TestBalancer::start(&[format!("{}/api", backend.url())]).await;

    let (status, body) = get(balancer.addr, "/users?id=7").await;
    assert_eq!(status, 200);
    assert_eq!(body, "b1 GET /api/users?id=7 HTTP/1.1");

    balancer.stop().await;
    backend.kill().await;
}

#[test]
fn test_config_file_builds_pool() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
listen:
  port: 3030
backends:
  - "http://localhost:3031"
  - "http://localhost:3032"
health_check:
  interval: 20s
  timeout: 1s
dispatch:
  max_attempts: 3
  max_retries: 3
  retry_delay: 10ms
"#,
    )
    .unwrap();

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.listen.port, 3030);
    assert_eq!(config.health_check.interval, Duration::from_secs(20));
    assert_eq!(config.dispatch.retry_delay, Duration::from_millis(10));

    let pool = BackendPool::from_urls(&config.backends).unwrap();
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.alive_count(), 2);
    assert_eq!(pool.backends()[0].connect_addr(), "localhost:3031");
}
