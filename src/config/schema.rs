//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind host).
    pub listener: ListenerConfig,

    /// HTTP relay behaviour (deadline, body limit, health path).
    pub relay: RelayConfig,

    /// CONNECT tunnel settings.
    pub tunnel: TunnelConfig,

    /// Subscriber channel settings.
    pub subscribers: SubscriberConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host every instance binds its listening port on (e.g., "0.0.0.0").
    pub bind_host: String,

    /// Concurrent connections accepted per instance before new ones wait
    /// in the kernel backlog.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            max_connections: 10_000,
        }
    }
}

/// HTTP relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Time allowed between issuing the outbound request and receiving
    /// response headers, in seconds.
    pub response_timeout_secs: u64,

    /// Largest request body the relay will buffer.
    pub max_request_body_bytes: usize,

    /// Reserved path answered by the relay itself.
    pub health_path: String,
}

impl RelayConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: 30,
            max_request_body_bytes: 10 * 1024 * 1024,
            health_path: "/_proxy/health".to_string(),
        }
    }
}

/// CONNECT tunnel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Largest CONNECT request head accepted before the socket is dropped.
    pub max_head_bytes: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 16 * 1024,
        }
    }
}

/// Subscriber channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Outbound frames buffered per subscriber before messages are dropped.
    pub buffer_size: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self { buffer_size: 32 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}
