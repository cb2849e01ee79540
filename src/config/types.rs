//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::FailurePolicy;

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 9007;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub broadcast: BroadcastConfig,
    pub monitoring: MonitoringConfig,
}

/// Listener and per-connection transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Payloads buffered per client before sends start waiting
    pub outbound_queue_size: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Payload encoding pushed on each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// The configured message, verbatim
    #[default]
    Text,
    /// A JSON frame with sequence number, timestamp, and connection count
    Json,
}

/// Periodic broadcast settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BroadcastConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub message: String,
    pub format: PayloadFormat,
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
    /// Drop clients whose sends fail because the session already ended
    pub evict_on_failure: bool,
}

impl BroadcastConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        if self.evict_on_failure {
            FailurePolicy::Evict
        } else {
            FailurePolicy::Retain
        }
    }
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// Serve Prometheus metrics on this address when set
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            outbound_queue_size: 64,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            message: "hello, world!".to_string(),
            format: PayloadFormat::Text,
            send_timeout: Duration::from_secs(1),
            evict_on_failure: false,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_addr: None,
        }
    }
}
