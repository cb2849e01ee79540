//! Session Handler
//!
//! Turns transport lifecycle events into registry membership changes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionRegistry};

pub struct SessionHandler<C: Connection> {
    registry: Arc<ConnectionRegistry<C>>,
}

impl<C: Connection> SessionHandler<C> {
    pub fn new(registry: Arc<ConnectionRegistry<C>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<C>> {
        &self.registry
    }

    /// Session established: include it in subsequent broadcasts
    pub async fn on_open(&self, connection: Arc<C>) {
        let id = connection.id();
        if self.registry.register(connection).await {
            info!(connection_id = %id, "Client connected");
        } else {
            warn!(connection_id = %id, "Open event for already registered connection");
        }
    }

    /// Session ended: exclude it from subsequent broadcasts.
    ///
    /// A broadcast already holding a snapshot may still try this handle once;
    /// that attempt fails on the handle, not here.
    pub async fn on_close(&self, connection: &C) {
        let id = connection.id();
        if self.registry.deregister(id).await {
            info!(connection_id = %id, "Client disconnected");
        } else {
            debug!(connection_id = %id, "Close event for unregistered connection");
        }
    }
}

impl<C: Connection> Clone for SessionHandler<C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, Payload, SendError};
    use std::time::Duration;

    struct NullConnection(ConnectionId);

    impl Connection for NullConnection {
        fn id(&self) -> ConnectionId {
            self.0
        }

        async fn send(&self, _payload: Payload) -> Result<(), SendError> {
            Ok(())
        }
    }

    fn handler() -> SessionHandler<NullConnection> {
        SessionHandler::new(Arc::new(ConnectionRegistry::new(Duration::from_secs(1))))
    }

    #[tokio::test]
    async fn test_open_then_close() {
        let handler = handler();
        let conn = Arc::new(NullConnection(ConnectionId::new(1)));

        handler.on_open(Arc::clone(&conn)).await;
        assert!(handler.registry().contains(conn.id()).await);

        handler.on_close(&conn).await;
        assert!(handler.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_close_without_open_is_tolerated() {
        let handler = handler();
        let conn = NullConnection(ConnectionId::new(5));

        handler.on_close(&conn).await;
        handler.on_close(&conn).await;
        assert!(handler.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_clones_share_registry() {
        let handler = handler();
        let other = handler.clone();

        other.on_open(Arc::new(NullConnection(ConnectionId::new(2)))).await;
        assert_eq!(handler.registry().len().await, 1);
    }
}
