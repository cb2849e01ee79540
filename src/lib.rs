//! Telecast Library
//!
//! WebSocket broadcast telemetry server: tracks live client connections and
//! periodically pushes a message to all of them.

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod server;
pub mod session;
pub mod shutdown;

pub use broadcast::{Broadcaster, BroadcasterState, Logger, PayloadSource, Tick};
pub use config::Config;
pub use connection::{
    BroadcastReport, Connection, ConnectionId, ConnectionRegistry, FailurePolicy, Payload,
    SendError, WsConnection,
};
pub use error::ServerError;
pub use server::TelemetryServer;
pub use session::SessionHandler;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the telemetry server
pub type Result<T> = anyhow::Result<T>;
