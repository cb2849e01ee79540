//! Telecast - WebSocket broadcast telemetry server
//!
//! Accepts WebSocket clients and pushes a telemetry message to every
//! connected client on a fixed interval.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use telecast::{
    config::{CliOverrides, ConfigManager},
    metrics::{Metrics, MetricsServer},
    ShutdownCoordinator, TelemetryServer,
};

/// CLI arguments for Telecast
#[derive(Parser, Debug)]
#[command(name = "telecast")]
#[command(about = "Telecast - WebSocket broadcast telemetry server")]
#[command(version)]
#[command(long_about = "
Telecast - WebSocket broadcast telemetry server

Every connected WebSocket client receives the configured message once per
broadcast interval.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TELECAST_BIND_ADDR        - Bind address (e.g., 0.0.0.0:9007)
  TELECAST_PORT             - Listening port
  TELECAST_MAX_CONNECTIONS  - Maximum concurrent clients
  TELECAST_INTERVAL         - Broadcast interval (e.g., 1s, 250ms)
  TELECAST_SEND_TIMEOUT     - Per-client send timeout (e.g., 1s)
  TELECAST_MESSAGE          - Broadcast message
  TELECAST_METRICS_ADDR     - Prometheus metrics address
  TELECAST_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Port to listen on (overrides config file)
    #[arg(value_parser = clap::value_parser!(u16).range(1..), help = "Port to listen on [default: 9007]")]
    pub port: Option<u16>,

    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "telecast.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 127.0.0.1:9007)")]
    pub bind: Option<String>,

    /// Broadcast interval
    #[arg(short, long, value_parser = humantime::parse_duration, help = "Broadcast interval (e.g., 1s, 500ms)")]
    pub interval: Option<Duration>,

    /// Broadcast message
    #[arg(short, long, help = "Message pushed to every client")]
    pub message: Option<String>,

    /// Prometheus metrics address
    #[arg(long, help = "Serve Prometheus metrics on this address")]
    pub metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level [default: from config, else info]")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Startup logs use the default level until the configured one is known
    let log_filter = init_tracing();

    info!("Starting Telecast v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(&CliOverrides {
        bind: args.bind.as_deref(),
        port: args.port,
        interval: args.interval,
        message: args.message.as_deref(),
        metrics_addr: args.metrics_addr,
        log_level: args.log_level.as_deref(),
        verbose: args.verbose,
    })?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    log_filter
        .reload(log_filter_for(&config.monitoring.log_level))
        .context("Failed to apply configured log level")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Max connections: {}", config.server.max_connections);
        info!("  Broadcast interval: {:?}", config.broadcast.interval);
        info!("  Send timeout: {:?}", config.broadcast.send_timeout);
        info!("  Payload format: {:?}", config.broadcast.format);
        info!("  Evict on failure: {}", config.broadcast.evict_on_failure);
        return Ok(());
    }

    let config = Arc::new(config);
    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let metrics = Arc::new(Metrics::new().context("Failed to create metrics")?);

    let server = TelemetryServer::bind(
        Arc::clone(&config),
        Some(Arc::clone(&metrics)),
        shutdown_coordinator.token(),
    )
    .await
    .context("Failed to start telemetry server")?;

    info!(
        "Starting WebSocket telemetry server on port {}",
        server.local_addr().port()
    );

    let mut tasks = Vec::new();

    if let Some(metrics_addr) = config.monitoring.metrics_addr {
        let metrics_server = MetricsServer::bind(Arc::clone(&metrics), metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics server on {}", metrics_addr))?;
        tasks.push((
            "metrics",
            tokio::spawn(metrics_server.serve(shutdown_coordinator.token())),
        ));
    }

    let broadcaster = server.broadcaster();
    let broadcaster_handle = broadcaster.spawn(shutdown_coordinator.token());
    let server_handle = tokio::spawn(server.serve());

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    info!("Initiating graceful shutdown...");

    match broadcaster_handle.await {
        Ok(ticks) => info!("Broadcaster stopped after {} ticks", ticks),
        Err(e) => error!("Broadcaster task failed: {}", e),
    }

    // The server waits on its own sessions; allow it that plus the other tasks.
    tasks.insert(0, ("server", server_handle));
    shutdown_coordinator.wait_for_tasks(tasks).await;

    info!("Server shutdown complete");

    Ok(())
}

/// `RUST_LOG` when set, otherwise `level`
fn log_filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize tracing/logging; the returned handle swaps the level filter
fn init_tracing() -> reload::Handle<EnvFilter, Registry> {
    let (env_filter, handle) = reload::Layer::new(log_filter_for("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .init();

    handle
}
