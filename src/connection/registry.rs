//! Connection Registry Implementation

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::handle::{Connection, ConnectionId, Payload, SendError};
use crate::metrics::Metrics;

/// What the registry does with a member whose send failed permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep the member; only the transport's close event removes it.
    #[default]
    Retain,
    /// Deregister members whose send reported [`SendError::Closed`].
    Evict,
}

/// Outcome of a single broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members captured in the snapshot
    pub recipients: usize,
    pub delivered: usize,
    /// All failed sends, timeouts included
    pub failed: usize,
    pub timed_out: usize,
    pub evicted: usize,
}

/// Authoritative set of live connections.
///
/// The membership lock is held only to mutate the set or to copy a snapshot
/// of it; the sends of a broadcast happen after it is released. Broadcasts
/// themselves are serialized on a separate lock, so a handle never sees two
/// sends in flight at once while register/deregister stay unblocked.
pub struct ConnectionRegistry<C: Connection> {
    members: RwLock<HashMap<ConnectionId, Arc<C>>>,
    fanout: Mutex<()>,
    send_timeout: Duration,
    failure_policy: FailurePolicy,
    metrics: Option<Arc<Metrics>>,
}

impl<C: Connection> ConnectionRegistry<C> {
    /// Create an empty registry with the given per-send timeout
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            fanout: Mutex::new(()),
            send_timeout,
            failure_policy: FailurePolicy::default(),
            metrics: None,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Add a connection. Returns `false` if it was already a member.
    pub async fn register(&self, connection: Arc<C>) -> bool {
        let id = connection.id();
        let total = {
            let mut members = self.members.write().await;
            match members.entry(id) {
                Entry::Occupied(_) => {
                    debug!(connection_id = %id, "Ignoring duplicate registration");
                    return false;
                }
                Entry::Vacant(slot) => {
                    slot.insert(connection);
                }
            }
            members.len()
        };

        if let Some(metrics) = &self.metrics {
            metrics.connection_opened();
        }
        debug!(connection_id = %id, total, "Registered connection");
        true
    }

    /// Remove a connection. Returns `false` if it was not a member.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let (removed, total) = {
            let mut members = self.members.write().await;
            let removed = members.remove(&id).is_some();
            (removed, members.len())
        };

        if removed {
            if let Some(metrics) = &self.metrics {
                metrics.connection_closed();
            }
            debug!(connection_id = %id, total, "Deregistered connection");
        } else {
            debug!(connection_id = %id, "Ignoring deregistration of unknown connection");
        }
        removed
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Point-in-time copy of the current members
    pub async fn snapshot(&self) -> Vec<Arc<C>> {
        self.members.read().await.values().cloned().collect()
    }

    /// Deliver `payload` to every current member.
    ///
    /// Sends run concurrently, each bounded by the send timeout. A failed send
    /// only affects its own connection and is reported in the returned
    /// [`BroadcastReport`], never to the caller as an error. Concurrent calls
    /// run one after another.
    pub async fn broadcast(&self, payload: Payload) -> BroadcastReport {
        self.broadcast_with(move |_| payload).await
    }

    /// Like [`broadcast`](Self::broadcast), with the payload built from the
    /// number of members in the snapshot that will receive it
    pub async fn broadcast_with<F>(&self, make_payload: F) -> BroadcastReport
    where
        F: FnOnce(usize) -> Payload + Send,
    {
        let _fanout = self.fanout.lock().await;

        let recipients = self.snapshot().await;
        let payload = make_payload(recipients.len());
        let mut report = BroadcastReport {
            recipients: recipients.len(),
            ..BroadcastReport::default()
        };

        if recipients.is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.record_broadcast(&report);
            }
            return report;
        }

        let send_timeout = self.send_timeout;
        let sends = recipients.iter().map(|connection| {
            let payload = payload.clone();
            async move {
                let outcome = match timeout(send_timeout, connection.send(payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(SendError::Timeout(send_timeout)),
                };
                (connection.id(), outcome)
            }
        });

        let mut closed = Vec::new();
        for (id, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(SendError::Timeout(after)) => {
                    report.failed += 1;
                    report.timed_out += 1;
                    warn!(connection_id = %id, timeout = ?after, "Send timed out");
                }
                Err(e) => {
                    report.failed += 1;
                    if e.is_permanent() {
                        debug!(connection_id = %id, "Send to closed connection");
                        closed.push(id);
                    } else {
                        warn!(connection_id = %id, error = %e, "Send failed");
                    }
                }
            }
        }

        if self.failure_policy == FailurePolicy::Evict {
            for id in closed {
                if self.deregister(id).await {
                    report.evicted += 1;
                    info!(connection_id = %id, "Evicted connection after failed send");
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_broadcast(&report);
        }

        debug!(
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failed,
            evicted = report.evicted,
            payload_bytes = payload.len(),
            "Broadcast complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingConnection {
        id: ConnectionId,
        received: Mutex<Vec<Payload>>,
        fail_with: Option<SendError>,
    }

    impl RecordingConnection {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new(id),
                received: Mutex::new(Vec::new()),
                fail_with: None,
            })
        }

        fn failing(id: u64, error: SendError) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new(id),
                received: Mutex::new(Vec::new()),
                fail_with: Some(error),
            })
        }

        fn received(&self) -> Vec<Payload> {
            self.received.lock().unwrap().clone()
        }
    }

    impl Connection for RecordingConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send(&self, payload: Payload) -> Result<(), SendError> {
            if let Some(error) = &self.fail_with {
                return Err(error.clone());
            }
            self.received.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn registry() -> ConnectionRegistry<RecordingConnection> {
        ConnectionRegistry::new(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let registry = registry();
        let conn = RecordingConnection::new(1);

        assert!(registry.register(conn.clone()).await);
        assert!(registry.contains(conn.id()).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.deregister(conn.id()).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_register_is_noop() {
        let registry = registry();
        let conn = RecordingConnection::new(1);

        assert!(registry.register(conn.clone()).await);
        assert!(!registry.register(conn.clone()).await);
        assert_eq!(registry.len().await, 1);

        registry.broadcast(Payload::from("once")).await;
        assert_eq!(conn.received().len(), 1);
    }

    #[tokio::test]
    async fn test_deregister_unknown_is_noop() {
        let registry = registry();
        assert!(!registry.deregister(ConnectionId::new(99)).await);
        assert!(!registry.deregister(ConnectionId::new(99)).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_registry() {
        let registry = registry();
        let report = registry.broadcast(Payload::from("nobody")).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_broadcast_reports_failures() {
        let registry = registry();
        let ok = RecordingConnection::new(1);
        let broken = RecordingConnection::failing(2, SendError::Transport("reset".to_string()));
        registry.register(ok.clone()).await;
        registry.register(broken).await;

        let report = registry.broadcast(Payload::from("tick")).await;
        assert_eq!(report.recipients, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(ok.received(), vec![Payload::from("tick")]);
    }

    #[tokio::test]
    async fn test_retain_policy_keeps_closed_connections() {
        let registry = registry();
        registry.register(RecordingConnection::failing(1, SendError::Closed)).await;

        let report = registry.broadcast(Payload::from("tick")).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_evict_policy_removes_only_closed_connections() {
        let registry = registry().with_failure_policy(FailurePolicy::Evict);
        registry.register(RecordingConnection::failing(1, SendError::Closed)).await;
        registry
            .register(RecordingConnection::failing(2, SendError::Transport("busy".to_string())))
            .await;
        registry.register(RecordingConnection::new(3)).await;

        let report = registry.broadcast(Payload::from("tick")).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.evicted, 1);
        assert!(!registry.contains(ConnectionId::new(1)).await);
        assert!(registry.contains(ConnectionId::new(2)).await);
        assert!(registry.contains(ConnectionId::new(3)).await);
    }

    #[tokio::test]
    async fn test_payload_built_from_snapshot_size() {
        let registry = registry();
        let a = RecordingConnection::new(1);
        registry.register(a.clone()).await;
        registry.register(RecordingConnection::new(2)).await;

        let report = registry
            .broadcast_with(|members| Payload::text(format!("{} members", members)))
            .await;
        assert_eq!(report.recipients, 2);
        assert_eq!(a.received(), vec![Payload::from("2 members")]);
    }

    #[tokio::test]
    async fn test_metrics_follow_membership() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let registry = registry().with_metrics(Arc::clone(&metrics));
        let conn = RecordingConnection::new(1);

        registry.register(conn.clone()).await;
        registry.register(conn.clone()).await;
        assert_eq!(metrics.active_connections(), 1);
        assert_eq!(metrics.total_connections(), 1);

        registry.broadcast(Payload::from("tick")).await;
        assert_eq!(metrics.broadcasts(), 1);
        assert_eq!(metrics.sends_delivered(), 1);

        registry.deregister(conn.id()).await;
        registry.deregister(conn.id()).await;
        assert_eq!(metrics.active_connections(), 0);
    }
}
