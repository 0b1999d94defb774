//! Client-facing listener.

mod listener;

pub use listener::FrontendListener;
