//! Server Bootstrap
//!
//! Owns the listening socket, performs the WebSocket handshake for each
//! accepted client, and reports session open/close to the session handler.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::broadcast::{Broadcaster, Logger, PayloadSource};
use crate::config::Config;
use crate::connection::{ConnectionId, ConnectionRegistry, WsConnection};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::session::SessionHandler;

pub type WsRegistry = ConnectionRegistry<WsConnection>;

/// WebSocket telemetry server
pub struct TelemetryServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<Config>,
    registry: Arc<WsRegistry>,
    handler: SessionHandler<WsConnection>,
    next_connection_id: AtomicU64,
    sessions: TaskTracker,
    cancel: CancellationToken,
}

impl TelemetryServer {
    /// Bind the listening socket. Nothing is accepted until [`serve`](Self::serve).
    pub async fn bind(
        config: Arc<Config>,
        metrics: Option<Arc<Metrics>>,
        cancel: CancellationToken,
    ) -> Result<Self, ServerError> {
        let addr = config.server.bind_addr;

        info!("Binding TCP listener to {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("Successfully bound to {}", local_addr);

        let mut registry = ConnectionRegistry::new(config.broadcast.send_timeout)
            .with_failure_policy(config.broadcast.failure_policy());
        if let Some(metrics) = metrics {
            registry = registry.with_metrics(metrics);
        }
        let registry = Arc::new(registry);

        Ok(Self {
            listener,
            local_addr,
            handler: SessionHandler::new(Arc::clone(&registry)),
            registry,
            config,
            next_connection_id: AtomicU64::new(1),
            sessions: TaskTracker::new(),
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<WsRegistry> {
        Arc::clone(&self.registry)
    }

    /// Handle for pushing messages outside the periodic ticks
    pub fn logger(&self) -> Logger<WsConnection> {
        Logger::new(Arc::clone(&self.registry))
    }

    /// Periodic broadcaster configured from the broadcast section
    pub fn broadcaster(&self) -> Broadcaster<WsConnection> {
        Broadcaster::new(
            Arc::clone(&self.registry),
            self.config.broadcast.interval,
            PayloadSource::from_config(&self.config.broadcast),
        )
    }

    /// Accept clients until the cancellation token fires, then give open
    /// sessions up to the shutdown timeout to finish.
    pub async fn serve(self) {
        info!("Starting connection acceptance loop");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr),
                    Err(e) => {
                        // Keep accepting even if one accept fails
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        }

        let Self {
            listener,
            sessions,
            config,
            ..
        } = self;
        drop(listener);

        sessions.close();
        let shutdown_timeout = config.server.shutdown_timeout;
        info!(
            "Waiting for {} sessions to close (timeout: {:?})",
            sessions.len(),
            shutdown_timeout
        );

        if timeout(shutdown_timeout, sessions.wait()).await.is_ok() {
            info!("All sessions closed");
        } else {
            warn!(
                "Shutdown timeout reached with {} sessions still open",
                sessions.len()
            );
        }
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        let max_connections = self.config.server.max_connections;
        if self.sessions.len() >= max_connections {
            warn!(
                "Connection limit of {} reached, rejecting connection from {}",
                max_connections, addr
            );
            return;
        }

        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        debug!("Accepted connection {} from {}", id, addr);

        self.sessions.spawn(run_session(
            stream,
            addr,
            id,
            self.handler.clone(),
            Arc::clone(&self.config),
            self.cancel.clone(),
        ));
    }
}

/// One client from handshake to disconnect
#[instrument(name = "session", skip_all, fields(connection_id = %id, peer = %addr))]
async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    handler: SessionHandler<WsConnection>,
    config: Arc<Config>,
    cancel: CancellationToken,
) {
    let handshake_timeout = config.server.handshake_timeout;
    let ws = match timeout(handshake_timeout, tokio_tungstenite::accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            warn!(timeout = ?handshake_timeout, "WebSocket handshake timed out");
            return;
        }
    };

    let (sink, mut inbound) = ws.split();
    let (connection, mut writer) = WsConnection::spawn(
        id,
        addr,
        sink,
        config.server.outbound_queue_size,
        config.server.write_timeout,
        &cancel,
    );

    handler.on_open(Arc::clone(&connection)).await;

    let mut writer_finished = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut writer => {
                writer_finished = true;
                break;
            }
            frame = inbound.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(frame)) => {
                    // Clients have nothing to say to a broadcast server
                    trace!(len = frame.len(), "Ignoring inbound frame");
                }
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket read failed");
                    break;
                }
            }
        }
    }

    handler.on_close(&connection).await;
    connection.close();
    if !writer_finished {
        let _ = timeout(config.server.write_timeout, writer).await;
    }

    debug!(connected_for = ?connection.connected_for(), "Session finished");
}
