//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|key| std::env::var(key).ok())
    }

    /// Apply `TELECAST_*` overrides read through `lookup` on top of the defaults
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(bind_addr) = lookup("TELECAST_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid TELECAST_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(port) = lookup("TELECAST_PORT") {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TELECAST_PORT: {}", port))?;
            config.server.bind_addr.set_port(port);
        }

        if let Some(max_conn) = lookup("TELECAST_MAX_CONNECTIONS") {
            config.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid TELECAST_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Some(interval) = lookup("TELECAST_INTERVAL") {
            config.broadcast.interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid TELECAST_INTERVAL: {}", interval))?;
        }

        if let Some(timeout) = lookup("TELECAST_SEND_TIMEOUT") {
            config.broadcast.send_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TELECAST_SEND_TIMEOUT: {}", timeout))?;
        }

        if let Some(message) = lookup("TELECAST_MESSAGE") {
            config.broadcast.message = message;
        }

        if let Some(metrics_addr) = lookup("TELECAST_METRICS_ADDR") {
            let addr = metrics_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid TELECAST_METRICS_ADDR: {}", metrics_addr))?;
            config.monitoring.metrics_addr = Some(addr);
        }

        if let Some(log_level) = lookup("TELECAST_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Values given on the command line, highest priority
#[derive(Debug, Clone, Default)]
pub struct CliOverrides<'a> {
    pub bind: Option<&'a str>,
    pub port: Option<u16>,
    pub interval: Option<Duration>,
    pub message: Option<&'a str>,
    pub metrics_addr: Option<SocketAddr>,
    pub log_level: Option<&'a str>,
    /// Forces the `debug` log level
    pub verbose: bool,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_broadcast_config()
            .with_context(|| "Broadcast configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if self.server.max_connections > 100000 {
            bail!("max_connections cannot exceed 100,000 for safety");
        }

        if self.server.outbound_queue_size == 0 {
            bail!("outbound_queue_size must be greater than 0");
        }

        if self.server.handshake_timeout.is_zero() {
            bail!("handshake_timeout must be greater than 0");
        }

        if self.server.write_timeout.is_zero() {
            bail!("write_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_broadcast_config(&self) -> Result<()> {
        if self.broadcast.interval.is_zero() {
            bail!("broadcast.interval must be greater than 0");
        }

        if self.broadcast.send_timeout.is_zero() {
            bail!("broadcast.send_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments. An unparsable bind address is an error.
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides<'_>) -> Result<()> {
        if let Some(bind_str) = overrides.bind {
            let addr = bind_str
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid bind address: {}", bind_str))?;
            self.server.bind_addr = addr;
            tracing::info!("CLI override: bind address set to {}", addr);
        }

        if let Some(port) = overrides.port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(interval) = overrides.interval {
            self.broadcast.interval = interval;
            tracing::info!("CLI override: broadcast interval set to {:?}", interval);
        }

        if let Some(message) = overrides.message {
            self.broadcast.message = message.to_string();
            tracing::info!("CLI override: broadcast message set");
        }

        if let Some(addr) = overrides.metrics_addr {
            self.monitoring.metrics_addr = Some(addr);
            tracing::info!("CLI override: metrics address set to {}", addr);
        }

        if overrides.verbose {
            self.monitoring.log_level = "debug".to_string();
        } else if let Some(level) = overrides.log_level {
            self.monitoring.log_level = level.to_string();
        }

        Ok(())
    }
}
