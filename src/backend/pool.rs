//! The backend pool and round-robin selection.

use super::{Backend, BackendError};
use hyper::Uri;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Fixed, ordered set of backends plus a shared rotation cursor.
///
/// The backend list is immutable after construction, so it is read without
/// any locking. The cursor is an atomic counter; each backend guards its own
/// liveness flag.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicUsize,
}

impl BackendPool {
    /// Create a pool. An empty list is a configuration error.
    pub fn new(backends: Vec<Backend>) -> Result<Self, BackendError> {
        if backends.is_empty() {
            return Err(BackendError::EmptyPool);
        }

        Ok(Self {
            backends: backends.into_iter().map(Arc::new).collect(),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Create a pool from backend URLs, in rotation order.
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Result<Self, BackendError> {
        let backends = urls
            .iter()
            .map(|url| Backend::parse(url.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(backends)
    }

    /// Pick the next live backend in round-robin order.
    ///
    /// Scans at most one full lap starting just past the cursor. When the hit
    /// is further along than the first candidate, the cursor jumps to it so
    /// the next call does not walk the same dead backends again.
    pub fn select_next(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        for offset in 0..len {
            let idx = start.wrapping_add(offset) % len;
            let backend = &self.backends[idx];

            if backend.is_alive() {
                if offset != 0 {
                    self.cursor.store(idx, Ordering::Relaxed);
                }
                return Some(Arc::clone(backend));
            }
        }

        debug!(backends = len, "no live backend in pool");
        None
    }

    /// Set the liveness of the backend with the given URL.
    ///
    /// Returns the previous liveness, or `None` when no backend matches.
    pub fn set_status(&self, uri: &Uri, alive: bool) -> Option<bool> {
        self.backends
            .iter()
            .find(|b| b.uri() == uri)
            .map(|b| b.set_alive(alive))
    }

    /// All backends in rotation order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Number of configured backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always false; an empty pool cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Number of backends currently believed alive.
    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }
}
