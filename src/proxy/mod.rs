//! Request forwarding and the dispatch policy.

mod dispatch;
mod http_proxy;

pub use dispatch::{error_response, AttemptState, DispatchLimits, Dispatcher};
pub use http_proxy::{BufferError, ForwardError, ForwardRequest, Forwarder, HttpForwarder, ProxyBody};
