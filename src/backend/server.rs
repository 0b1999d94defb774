//! A single upstream server and its liveness flag.

use hyper::http::uri::{Authority, InvalidUri, Scheme};
use hyper::Uri;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors building backends or a backend pool.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid URL: {0}")]
    InvalidUri(#[from] InvalidUri),

    #[error("missing scheme (expected http://host:port)")]
    MissingScheme,

    #[error("unsupported scheme '{0}' (only http is supported)")]
    UnsupportedScheme(String),

    #[error("missing host")]
    MissingHost,

    #[error("backend pool needs at least one backend")]
    EmptyPool,
}

/// Parse and check a backend URL.
///
/// The URL must be absolute, use the `http` scheme and name a host.
pub fn parse_backend_uri(url: &str) -> Result<Uri, BackendError> {
    let uri: Uri = url.trim().parse()?;

    match uri.scheme() {
        None => return Err(BackendError::MissingScheme),
        Some(scheme) if *scheme != Scheme::HTTP => {
            return Err(BackendError::UnsupportedScheme(scheme.to_string()));
        }
        Some(_) => {}
    }

    match uri.host() {
        Some(host) if !host.is_empty() => Ok(uri),
        _ => Err(BackendError::MissingHost),
    }
}

/// One upstream server.
///
/// The address never changes after construction. The liveness flag is an
/// atomic owned by this backend alone, so flipping one backend never
/// contends with readers of another.
#[derive(Debug)]
pub struct Backend {
    uri: Uri,
    authority: Authority,
    connect_addr: String,
    alive: AtomicBool,
}

impl Backend {
    /// Create a backend from a checked URI. New backends start alive.
    pub fn new(uri: Uri) -> Result<Self, BackendError> {
        let authority = uri.authority().cloned().ok_or(BackendError::MissingHost)?;
        let port = authority.port_u16().unwrap_or(80);
        let connect_addr = format!("{}:{}", authority.host(), port);

        Ok(Self {
            uri,
            authority,
            connect_addr,
            alive: AtomicBool::new(true),
        })
    }

    /// Parse a backend from its URL string.
    pub fn parse(url: &str) -> Result<Self, BackendError> {
        Self::new(parse_backend_uri(url)?)
    }

    /// The configured URL.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Host and optional port, as the `Host` header should carry it.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// `host:port` to open TCP connections to (port defaults to 80).
    pub fn connect_addr(&self) -> &str {
        &self.connect_addr
    }

    /// Path prefix requests are forwarded under, `/` when none was configured.
    pub fn base_path(&self) -> &str {
        self.uri.path()
    }

    /// Whether the backend is currently believed to accept connections.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Set liveness, returning the previous value.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::AcqRel)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}
