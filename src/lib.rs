//! rrproxy - a round-robin HTTP reverse-proxy load balancer
//!
//! Requests are spread across a fixed set of backends in strict rotation,
//! skipping backends believed to be down. An active TCP health checker
//! keeps liveness current, and failed forwards are retried against the
//! same backend before the backend is marked down and the request moves on.

pub mod backend;
pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod util;

pub use config::Config;
