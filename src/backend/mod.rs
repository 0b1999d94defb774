//! Backend records and the round-robin backend pool.

mod pool;
mod server;

pub use pool::BackendPool;
pub use server::{parse_backend_uri, Backend, BackendError};
