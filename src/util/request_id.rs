//! Request and connection identifiers for log correlation.

use hyper::header::{HeaderMap, HeaderValue};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Header carrying the request ID to and from backends.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Counter for short connection IDs.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier attached to a request or connection in logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new random (UUID v4) request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a short, process-unique ID: `conn-{counter}` in 16 hex digits.
    pub fn short() -> Self {
        let count = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn-{:016x}", count))
    }

    /// Reuse the caller's `x-request-id` when it is present and readable,
    /// otherwise generate a fresh one.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::from_string)
            .unwrap_or_default()
    }

    /// Create a request ID from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the request ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The ID as a header value, if it is representable as one.
    pub fn to_header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.0).ok()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
