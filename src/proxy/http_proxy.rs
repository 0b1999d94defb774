//! HTTP forwarding to a single backend.
//!
//! Rewrites a buffered client request for the chosen backend and sends it
//! over a fresh HTTP/1.1 connection.

use crate::backend::Backend;
use crate::util::{RequestId, REQUEST_ID_HEADER};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::PathAndQuery;
use hyper::{Method, Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Response body type shared by forwarded and locally generated responses.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwarding failure.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to connect to backend: {0}")]
    Connect(#[source] std::io::Error),

    #[error("connection to backend timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("backend handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("failed to send request to backend: {0}")]
    Send(#[source] hyper::Error),

    #[error("could not build backend request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),
}

/// Failure to buffer an inbound request body.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("failed to read request body: {0}")]
    Read(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ForwardError {
    /// Whether the failure came from the network and may clear up on retry.
    pub fn is_transport(&self) -> bool {
        !matches!(self, ForwardError::InvalidRequest(_))
    }
}

/// A client request with its body fully buffered, replayable across retries.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: SocketAddr,
    pub request_id: RequestId,
}

impl ForwardRequest {
    /// Buffer an inbound request, reading at most `limit` body bytes.
    pub async fn buffer<B>(
        req: Request<B>,
        client_addr: SocketAddr,
        limit: usize,
    ) -> Result<Self, BufferError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request_id = RequestId::from_headers(req.headers());
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => return Err(BufferError::TooLarge(limit)),
            Err(e) => return Err(BufferError::Read(e)),
        };

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            client_addr,
            request_id,
        })
    }
}

/// Sends one request to one backend. The dispatch policy sits on top.
pub trait Forwarder: Send + Sync + 'static {
    /// Forward `req` to `backend`, yielding the backend's response.
    ///
    /// Any HTTP status is a success; only failures to exchange a request
    /// and response come back as errors.
    fn forward(
        &self,
        backend: &Backend,
        req: &ForwardRequest,
    ) -> impl Future<Output = Result<Response<ProxyBody>, ForwardError>> + Send;
}

/// Forwarder speaking HTTP/1.1 over a new TCP connection per request.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    connect_timeout: Duration,
}

impl HttpForwarder {
    /// Create a forwarder with the given backend connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        backend: &Backend,
        req: &ForwardRequest,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let outbound = outbound_request(backend, req)?;

        let stream = match timeout(self.connect_timeout, TcpStream::connect(backend.connect_addr())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ForwardError::Connect(e)),
            Err(_) => return Err(ForwardError::ConnectTimeout(self.connect_timeout)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on backend connection");
        }

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ForwardError::Handshake)?;

        // Drive the connection until the response body is consumed
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "backend connection closed with error");
            }
        });

        let response = sender
            .send_request(outbound)
            .await
            .map_err(ForwardError::Send)?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        if let Ok(value) = HeaderValue::from_str(&backend.to_string()) {
            parts.headers.insert("x-served-by", value);
        }

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Build the request the backend will see.
fn outbound_request(
    backend: &Backend,
    req: &ForwardRequest,
) -> Result<Request<Full<Bytes>>, ForwardError> {
    let uri = rewrite_uri(backend.uri(), &req.uri)?;

    let mut headers = req.headers.clone();
    let original_host = headers.remove(header::HOST);
    strip_hop_by_hop(&mut headers);

    if let Ok(host) = HeaderValue::from_str(backend.authority().as_str()) {
        headers.insert(header::HOST, host);
    }

    let client_ip = req.client_addr.ip().to_string();
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Some(host) = original_host {
        headers.insert("x-forwarded-host", host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(id) = req.request_id.to_header_value() {
        headers.insert(REQUEST_ID_HEADER, id);
    }

    let mut outbound = Request::builder()
        .method(req.method.clone())
        .uri(uri)
        .version(Version::HTTP_11)
        .body(Full::new(req.body.clone()))?;
    *outbound.headers_mut() = headers;

    Ok(outbound)
}

/// Origin-form URI for the backend: the backend's base path joined with the
/// request path, and both queries combined.
fn rewrite_uri(target: &Uri, incoming: &Uri) -> Result<Uri, ForwardError> {
    let path = join_paths(target.path(), incoming.path());
    let path_and_query = match (target.query(), incoming.query()) {
        (Some(t), Some(i)) if !t.is_empty() && !i.is_empty() => format!("{}?{}&{}", path, t, i),
        (Some(t), _) if !t.is_empty() => format!("{}?{}", path, t),
        (_, Some(i)) => format!("{}?{}", path, i),
        _ => path,
    };

    let path_and_query: PathAndQuery = path_and_query
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ForwardError::InvalidRequest(e.into()))?;
    Ok(Uri::from(path_and_query))
}

/// Join two paths with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
