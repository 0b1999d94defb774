//! Configuration validation.

use crate::backend::parse_backend_uri;
use crate::config::Config;
use std::collections::HashSet;
use std::time::Duration;

/// Validate the configuration.
///
/// Checks for:
/// - At least one backend
/// - Every backend is an absolute `http://` URL with a host
/// - No duplicate backends
/// - Usable health check and dispatch limits
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.backends.is_empty() {
        errors.push("at least one backend must be defined".to_string());
    }

    let mut seen = HashSet::new();
    for backend in &config.backends {
        match parse_backend_uri(backend) {
            Ok(uri) => {
                // Compare on the parsed form so "http://a:1" and "http://a:1/" collide
                if !seen.insert(uri.to_string()) {
                    errors.push(format!("duplicate backend: {}", backend));
                }
            }
            Err(e) => errors.push(format!("invalid backend '{}': {}", backend, e)),
        }
    }

    if config.health_check.interval == Duration::ZERO {
        errors.push("health check interval must be greater than zero".to_string());
    }

    if config.health_check.timeout == Duration::ZERO {
        errors.push("health check timeout must be greater than zero".to_string());
    }

    if config.dispatch.max_attempts == 0 {
        errors.push("dispatch max_attempts must be at least 1".to_string());
    }

    if config.dispatch.request_timeout == Some(Duration::ZERO) {
        errors.push("dispatch request_timeout must be greater than zero".to_string());
    }

    if config.dispatch.max_body_size == 0 {
        errors.push("dispatch max_body_size must be greater than zero".to_string());
    }

    if config.global.metrics.enabled && !config.global.metrics.path.starts_with('/') {
        errors.push(format!(
            "metrics path '{}' must start with '/'",
            config.global.metrics.path
        ));
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
