//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use telecast::{Connection, ConnectionId, Payload, SendError};

/// Records every payload it is sent; can be told to fail or stall
pub struct MockConnection {
    id: ConnectionId,
    received: Mutex<Vec<Payload>>,
    failure: Mutex<Option<SendError>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
}

impl MockConnection {
    pub fn new(id: u64) -> Arc<Self> {
        Self::build(id, None, None)
    }

    pub fn failing(id: u64, error: SendError) -> Arc<Self> {
        Self::build(id, Some(error), None)
    }

    pub fn slow(id: u64, delay: Duration) -> Arc<Self> {
        Self::build(id, None, Some(delay))
    }

    fn build(id: u64, failure: Option<SendError>, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(id),
            received: Mutex::new(Vec::new()),
            failure: Mutex::new(failure),
            delay,
            in_flight: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        })
    }

    pub fn set_failure(&self, error: Option<SendError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn received(&self) -> Vec<Payload> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Whether two sends to this handle ever ran at the same time
    pub fn saw_overlapping_sends(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, payload: Payload) -> Result<(), SendError> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failure.lock().unwrap().clone();
        let result = match failure {
            Some(error) => Err(error),
            None => {
                self.received.lock().unwrap().push(payload);
                Ok(())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
