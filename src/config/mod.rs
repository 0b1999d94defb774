//! Configuration loading, parsing, and validation.

mod loader;
mod types;
mod validation;

pub use loader::{check_config, load_config, read_config, ConfigError};
pub use types::*;
pub use validation::validate_config;
