//! Connection Management Module
//!
//! Connection handles, the registry of live connections, and the WebSocket
//! implementation of a handle.

pub mod handle;
pub mod registry;
pub mod websocket;

pub use handle::{Connection, ConnectionId, Payload, SendError};
pub use registry::{BroadcastReport, ConnectionRegistry, FailurePolicy};
pub use websocket::WsConnection;
