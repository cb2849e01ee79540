//! Connection Handle
//!
//! The seam between the registry and whatever transport carries a session.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Process-unique identity of a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// A message handed to the registry for delivery to every member.
///
/// Both variants are reference counted, so cloning per recipient is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Arc<str>),
    Binary(Bytes),
}

impl Payload {
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Payload::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Payload::Binary(data.into())
    }

    /// Size of the payload body in bytes
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::text(text)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::text(text)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Binary(data)
    }
}

/// Why a single send did not reach its peer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The session has ended; the handle will never accept another payload.
    #[error("connection closed")]
    Closed,

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SendError {
    /// Whether retrying against the same handle can ever succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Closed)
    }
}

/// One live client session as seen by the registry.
///
/// Implementations must tolerate `send` being called after the session has
/// ended and report that as [`SendError::Closed`] instead of touching the
/// released transport.
pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn send(&self, payload: Payload) -> impl Future<Output = Result<(), SendError>> + Send;
}
