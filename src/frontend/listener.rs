//! Frontend listener implementation.
//!
//! Accepts client connections and serves HTTP/1.1 on each, handing every
//! request to the dispatcher.

use crate::metrics::MetricsCollector;
use crate::proxy::{Dispatcher, Forwarder};
use crate::util::RequestId;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Frontend listener that accepts and handles connections.
pub struct FrontendListener<F> {
    /// TCP listener.
    listener: TcpListener,
    /// Dispatcher shared by every connection.
    dispatcher: Arc<Dispatcher<F>>,
    /// Metrics collector.
    metrics: MetricsCollector,
}

impl<F: Forwarder> FrontendListener<F> {
    /// Bind the listen address.
    pub async fn bind(
        address: SocketAddr,
        dispatcher: Arc<Dispatcher<F>>,
        metrics: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;

        info!(listen = %listener.local_addr()?, "frontend listener bound");

        Ok(Self {
            listener,
            dispatcher,
            metrics,
        })
    }

    /// Address actually bound (useful when binding port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    #[instrument(skip_all, fields(listen = ?self.listener.local_addr().ok()))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("frontend listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }
    }

    /// Serve one client connection on its own task.
    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let metrics = self.metrics.clone();
        let connection_id = RequestId::short();

        metrics.connection_opened();

        tokio::spawn(async move {
            let start_time = Instant::now();

            let service = service_fn(move |req: Request<Incoming>| {
                let dispatcher = Arc::clone(&dispatcher);
                async move { Ok::<_, Infallible>(dispatcher.handle(req, client_addr).await) }
            });

            let result = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), service)
                .await;

            metrics.connection_closed();
            let duration = start_time.elapsed();

            match result {
                Ok(()) => debug!(
                    client = %client_addr,
                    connection_id = %connection_id,
                    duration_ms = duration.as_millis(),
                    "connection completed"
                ),
                Err(e) => warn!(
                    client = %client_addr,
                    connection_id = %connection_id,
                    duration_ms = duration.as_millis(),
                    error = %e,
                    "connection handling failed"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendPool;
    use crate::config::DispatchConfig;
    use crate::proxy::{DispatchLimits, HttpForwarder};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn dispatcher_with(
        pool: Arc<BackendPool>,
        retry_delay: Duration,
        metrics: MetricsCollector,
    ) -> Arc<Dispatcher<HttpForwarder>> {
        let config = DispatchConfig {
            retry_delay,
            ..DispatchConfig::default()
        };
        Arc::new(Dispatcher::new(
            pool,
            HttpForwarder::new(Duration::from_millis(500)),
            DispatchLimits::from(&config),
            metrics,
        ))
    }

    fn dispatcher(backend_url: &str) -> Arc<Dispatcher<HttpForwarder>> {
        let pool = Arc::new(BackendPool::from_urls(&[backend_url]).unwrap());
        dispatcher_with(pool, Duration::from_millis(1), MetricsCollector::new())
    }

    async fn closed_backend() -> String {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = format!("http://{}", closed.local_addr().unwrap());
        drop(closed);
        backend
    }

    #[tokio::test]
    async fn test_frontend_listener_bind() {
        let listener = FrontendListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            dispatcher("http://127.0.0.1:9000"),
            MetricsCollector::new(),
        )
        .await
        .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_answers_503() {
        let backend = closed_backend().await;

        let listener = FrontendListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            dispatcher(&backend),
            MetricsCollector::new(),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: lb\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);
        assert!(response.contains("Service Unavailable"));

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_disconnect_abandons_pending_retry() {
        let backend = closed_backend().await;
        let pool = Arc::new(BackendPool::from_urls(&[backend.as_str()]).unwrap());
        let metrics = MetricsCollector::new();
        let dispatcher = dispatcher_with(Arc::clone(&pool), Duration::from_millis(300), metrics.clone());

        let listener = FrontendListener::bind("127.0.0.1:0".parse().unwrap(), dispatcher, metrics.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: lb\r\n\r\n")
            .await
            .unwrap();

        // Hang up while the first retry delay is still running
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);

        // Long enough for every retry to have run had the request survived
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(pool.backends()[0].is_alive());

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, metrics.registry()).unwrap();
        let forward_errors = format!(
            "rrproxy_forward_errors_total{{backend=\"{}\"}} 1\n",
            pool.backends()[0]
        );
        assert!(out.contains(&forward_errors), "metrics: {}", out);
        assert!(!out.contains("rrproxy_retries_total{"), "metrics: {}", out);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
