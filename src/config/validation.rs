//! Configuration validation.
//!
//! Serde handles syntax; this module checks values that parse but cannot
//! work (zero deadlines, empty buffers, malformed paths). Every violation is
//! reported, not just the first.

use std::net::IpAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_host.parse::<IpAddr>().is_err() && config.listener.bind_host != "localhost" {
        errors.push(ValidationError {
            field: "listener.bind_host",
            message: format!("'{}' is not an IP address", config.listener.bind_host),
        });
    }

    if config.listener.max_connections == 0 {
        errors.push(ValidationError {
            field: "listener.max_connections",
            message: "must be greater than zero".to_string(),
        });
    }

    if config.relay.response_timeout_secs == 0 {
        errors.push(ValidationError {
            field: "relay.response_timeout_secs",
            message: "must be greater than zero".to_string(),
        });
    }

    if config.relay.max_request_body_bytes == 0 {
        errors.push(ValidationError {
            field: "relay.max_request_body_bytes",
            message: "must be greater than zero".to_string(),
        });
    }

    if !config.relay.health_path.starts_with('/') {
        errors.push(ValidationError {
            field: "relay.health_path",
            message: format!("'{}' must start with '/'", config.relay.health_path),
        });
    }

    if config.tunnel.max_head_bytes < 64 {
        errors.push(ValidationError {
            field: "tunnel.max_head_bytes",
            message: "must be at least 64 bytes".to_string(),
        });
    }

    if config.subscribers.buffer_size == 0 {
        errors.push(ValidationError {
            field: "subscribers.buffer_size",
            message: "must be greater than zero".to_string(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_violation() {
        let mut config = ProxyConfig::default();
        config.listener.bind_host = "not-an-ip".into();
        config.relay.response_timeout_secs = 0;
        config.relay.health_path = "health".into();
        config.subscribers.buffer_size = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_host",
                "relay.response_timeout_secs",
                "relay.health_path",
                "subscribers.buffer_size",
            ]
        );
    }
}
