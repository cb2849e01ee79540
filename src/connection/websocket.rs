//! WebSocket Connection
//!
//! A [`Connection`] backed by a tokio-tungstenite sink. Every write to the
//! socket happens on one writer task fed by a bounded queue, so concurrent
//! broadcasts never issue overlapping writes to the same peer.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handle::{Connection, ConnectionId, Payload, SendError};

/// Handle to one WebSocket client
pub struct WsConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    connected_at: Instant,
    outbound: mpsc::Sender<Payload>,
    closing: CancellationToken,
}

impl WsConnection {
    /// Wrap `sink` and start its writer task.
    ///
    /// The writer stops when [`WsConnection::close`] is called, when a write
    /// fails or exceeds `write_timeout`, or when `shutdown` is cancelled.
    pub fn spawn<S>(
        id: ConnectionId,
        peer_addr: SocketAddr,
        sink: S,
        queue_size: usize,
        write_timeout: Duration,
        shutdown: &CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
    {
        let (outbound, rx) = mpsc::channel(queue_size.max(1));
        let closing = shutdown.child_token();

        let writer = tokio::spawn(run_writer(id, sink, rx, write_timeout, closing.clone()));

        let connection = Arc::new(Self {
            id,
            peer_addr,
            connected_at: Instant::now(),
            outbound,
            closing,
        });
        (connection, writer)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Stop the writer; later sends fail with [`SendError::Closed`]
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled() || self.outbound.is_closed()
    }
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, payload: Payload) -> Result<(), SendError> {
        if self.closing.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound
            .send(payload)
            .await
            .map_err(|_| SendError::Closed)
    }
}

fn into_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::text(text.to_string()),
        Payload::Binary(data) => Message::binary(data),
    }
}

async fn run_writer<S>(
    id: ConnectionId,
    mut sink: S,
    mut rx: mpsc::Receiver<Payload>,
    write_timeout: Duration,
    closing: CancellationToken,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    loop {
        tokio::select! {
            biased;
            _ = closing.cancelled() => {
                // Best effort close frame; the peer may already be gone.
                let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
                break;
            }
            next = rx.recv() => {
                let Some(payload) = next else { break };
                match timeout(write_timeout, sink.send(into_message(payload))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "WebSocket write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(connection_id = %id, timeout = ?write_timeout, "WebSocket write timed out");
                        break;
                    }
                }
            }
        }
    }

    rx.close();
    closing.cancel();
    let _ = timeout(write_timeout, sink.close()).await;
    debug!(connection_id = %id, "Writer task stopped");
}
