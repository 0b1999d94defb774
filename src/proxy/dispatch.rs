//! Request dispatch: backend selection plus retry and attempt escalation.
//!
//! A request gets up to `max_attempts` distinct backends. Within one
//! attempt, a transport failure is retried against the same backend up to
//! `max_retries` times, `retry_delay` apart. A backend that fails every
//! retry is marked down and the request moves on to the next live backend.

use super::http_proxy::{BufferError, ForwardRequest, Forwarder, ProxyBody};
use crate::backend::{Backend, BackendPool};
use crate::config::DispatchConfig;
use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn, Span};

/// Escalation counters for one inbound request.
///
/// `attempts` counts backends handed the request (from 1); `retries` counts
/// re-sends to the current backend (from 0, reset on every new attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptState {
    pub attempts: u32,
    pub retries: u32,
}

impl AttemptState {
    /// State of a fresh request.
    pub fn new() -> Self {
        Self {
            attempts: 1,
            retries: 0,
        }
    }

    /// Same backend, one more retry.
    pub fn next_retry(self) -> Self {
        Self {
            retries: self.retries + 1,
            ..self
        }
    }

    /// Next backend, retries reset.
    pub fn next_attempt(self) -> Self {
        Self {
            attempts: self.attempts + 1,
            retries: 0,
        }
    }
}

impl Default for AttemptState {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry and attempt limits.
#[derive(Debug, Clone)]
pub struct DispatchLimits {
    pub max_attempts: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Option<Duration>,
    pub max_body_size: usize,
}

impl From<&DispatchConfig> for DispatchLimits {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            request_timeout: config.request_timeout,
            max_body_size: config.max_body_size,
        }
    }
}

/// Outcome of one attempt against one backend.
enum AttemptOutcome {
    /// The backend answered, or the request cannot be sent anywhere.
    Done(Response<ProxyBody>),
    /// Every retry failed; the backend should be condemned.
    Exhausted,
}

/// Handles inbound requests against a backend pool.
pub struct Dispatcher<F> {
    pool: Arc<BackendPool>,
    forwarder: F,
    limits: DispatchLimits,
    metrics: MetricsCollector,
}

impl<F: Forwarder> Dispatcher<F> {
    /// Create a dispatcher.
    pub fn new(
        pool: Arc<BackendPool>,
        forwarder: F,
        limits: DispatchLimits,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            pool,
            forwarder,
            limits,
            metrics,
        }
    }

    /// Handle one inbound request end to end.
    ///
    /// The body is buffered, up to `max_body_size` bytes, so every retry and
    /// attempt can replay it; a larger body is answered with 413. When
    /// a request timeout is configured and fires, whatever is pending
    /// (including a retry delay) is dropped and the caller gets 504.
    #[instrument(skip_all, fields(
        method = %req.method(),
        path = %req.uri().path(),
        client = %client_addr,
        request_id = tracing::field::Empty,
    ))]
    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = Instant::now();

        let request = match ForwardRequest::buffer(req, client_addr, self.limits.max_body_size).await {
            Ok(request) => request,
            Err(e) => {
                let response = match e {
                    BufferError::TooLarge(limit) => {
                        warn!(limit, "request body too large");
                        error_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large")
                    }
                    BufferError::Read(e) => {
                        warn!(error = %e, "failed to read request body");
                        error_response(StatusCode::BAD_REQUEST, "Failed to read request body")
                    }
                };
                self.metrics.record_request(response.status().as_u16(), start.elapsed());
                return response;
            }
        };
        Span::current().record("request_id", request.request_id.as_str());

        let response = match self.limits.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.dispatch(&request)).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(timeout = ?limit, "request deadline exceeded, abandoning dispatch");
                    error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
                }
            },
            None => self.dispatch(&request).await,
        };

        let status = response.status().as_u16();
        let duration = start.elapsed();
        self.metrics.record_request(status, duration);
        debug!(status, duration_ms = duration.as_millis(), "request finished");

        response
    }

    /// Run the attempt loop for a buffered request.
    pub async fn dispatch(&self, req: &ForwardRequest) -> Response<ProxyBody> {
        let mut state = AttemptState::new();

        while state.attempts <= self.limits.max_attempts {
            let Some(backend) = self.pool.select_next() else {
                warn!(attempt = state.attempts, "no live backend available");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
            };

            debug!(backend = %backend, attempt = state.attempts, "dispatching request");

            match self.attempt(&backend, req, state).await {
                AttemptOutcome::Done(response) => return response,
                AttemptOutcome::Exhausted => {
                    let name = backend.to_string();
                    if self.pool.set_status(backend.uri(), false) == Some(true) {
                        warn!(backend = %name, "backend marked down after exhausting retries");
                    }
                    self.metrics.record_ejection(&name);

                    state = state.next_attempt();
                    if state.attempts <= self.limits.max_attempts {
                        info!(attempt = state.attempts, "attempting another backend");
                    }
                }
            }
        }

        warn!(
            attempts = self.limits.max_attempts,
            "max attempts reached, terminating"
        );
        self.metrics.record_exhausted();
        error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    }

    /// Forward to one backend, retrying transport failures in place.
    async fn attempt(
        &self,
        backend: &Backend,
        req: &ForwardRequest,
        mut state: AttemptState,
    ) -> AttemptOutcome {
        loop {
            let error = match self.forwarder.forward(backend, req).await {
                Ok(response) => return AttemptOutcome::Done(response),
                Err(e) => e,
            };

            let name = backend.to_string();
            if !error.is_transport() {
                warn!(backend = %name, error = %error, "request cannot be forwarded");
                return AttemptOutcome::Done(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }

            warn!(
                backend = %name,
                attempt = state.attempts,
                retry = state.retries,
                error = %error,
                "forwarding failed"
            );
            self.metrics.record_forward_error(&name);

            if state.retries >= self.limits.max_retries {
                return AttemptOutcome::Exhausted;
            }

            tokio::time::sleep(self.limits.retry_delay).await;
            state = state.next_retry();
            self.metrics.record_retry(&name);
            debug!(backend = %name, retry = state.retries, "retrying backend");
        }
    }
}

/// Plain-text error response generated by the proxy itself.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
