//! Periodic Broadcaster
//!
//! Drives one broadcast per tick, independent of connection churn.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{BroadcastConfig, PayloadFormat};
use crate::connection::{BroadcastReport, Connection, ConnectionRegistry, Payload};

/// Broadcaster state; there is no failure state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterState {
    Idle,
    Broadcasting,
}

impl BroadcasterState {
    fn as_u8(self) -> u8 {
        match self {
            BroadcasterState::Idle => 0,
            BroadcasterState::Broadcasting => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BroadcasterState::Broadcasting,
            _ => BroadcasterState::Idle,
        }
    }
}

/// Shared view of a running broadcaster
#[derive(Debug)]
pub struct BroadcasterStatus {
    state: AtomicU8,
    ticks: AtomicU64,
    last_delivered: AtomicU64,
}

impl BroadcasterStatus {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(BroadcasterState::Idle.as_u8()),
            ticks: AtomicU64::new(0),
            last_delivered: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BroadcasterState {
        BroadcasterState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Deliveries made by the most recent broadcast
    pub fn last_delivered(&self) -> u64 {
        self.last_delivered.load(Ordering::Acquire)
    }

    fn set_state(&self, state: BroadcasterState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// Context handed to a computed payload source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based tick number
    pub seq: u64,
    /// Members in the snapshot this tick is delivered to
    pub connections: usize,
}

/// Where each tick's payload comes from
pub enum PayloadSource {
    Fixed(Payload),
    Computed(Box<dyn FnMut(&Tick) -> Payload + Send>),
}

impl PayloadSource {
    pub fn fixed(payload: impl Into<Payload>) -> Self {
        PayloadSource::Fixed(payload.into())
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: FnMut(&Tick) -> Payload + Send + 'static,
    {
        PayloadSource::Computed(Box::new(f))
    }

    /// Build the source described by the broadcast section of the config
    pub fn from_config(config: &BroadcastConfig) -> Self {
        match config.format {
            PayloadFormat::Text => PayloadSource::fixed(config.message.as_str()),
            PayloadFormat::Json => {
                let message = config.message.clone();
                PayloadSource::computed(move |tick| telemetry_frame(tick, &message))
            }
        }
    }

    fn next(&mut self, tick: &Tick) -> Payload {
        match self {
            PayloadSource::Fixed(payload) => payload.clone(),
            PayloadSource::Computed(f) => f(tick),
        }
    }
}

#[derive(Serialize)]
struct TelemetryFrame<'a> {
    seq: u64,
    timestamp_ms: u64,
    connections: usize,
    message: &'a str,
}

fn saturating_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// JSON telemetry frame for one tick
pub fn telemetry_frame(tick: &Tick, message: &str) -> Payload {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(saturating_millis)
        .unwrap_or_default();

    let frame = TelemetryFrame {
        seq: tick.seq,
        timestamp_ms,
        connections: tick.connections,
        message,
    };

    match serde_json::to_string(&frame) {
        Ok(json) => Payload::text(json),
        Err(_) => Payload::text(message),
    }
}

/// Periodic producer calling [`ConnectionRegistry::broadcast`] once per tick
pub struct Broadcaster<C: Connection> {
    registry: Arc<ConnectionRegistry<C>>,
    period: Duration,
    source: PayloadSource,
    status: Arc<BroadcasterStatus>,
}

impl<C: Connection> Broadcaster<C> {
    pub fn new(registry: Arc<ConnectionRegistry<C>>, period: Duration, source: PayloadSource) -> Self {
        Self {
            registry,
            period,
            source,
            status: Arc::new(BroadcasterStatus::new()),
        }
    }

    pub fn status(&self) -> Arc<BroadcasterStatus> {
        Arc::clone(&self.status)
    }

    /// Broadcast every `period` until `cancel` fires; returns the tick count.
    ///
    /// The first tick fires immediately. A tick that runs long delays the
    /// next one rather than bursting to catch up.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(period = ?self.period, "Broadcaster started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let seq = self.status.ticks.load(Ordering::Acquire) + 1;
            self.status.set_state(BroadcasterState::Broadcasting);

            let source = &mut self.source;
            let report = self
                .registry
                .broadcast_with(|connections| source.next(&Tick { seq, connections }))
                .await;

            self.status.last_delivered.store(report.delivered as u64, Ordering::Release);
            self.status.ticks.store(seq, Ordering::Release);
            self.status.set_state(BroadcasterState::Idle);

            if report.failed > 0 {
                debug!(seq, delivered = report.delivered, failed = report.failed, "Tick finished with failures");
            }
        }

        let ticks = self.status.ticks();
        info!(ticks, "Broadcaster stopped");
        ticks
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(cancel))
    }
}

/// On-demand broadcasting for application code, alongside the periodic ticks
pub struct Logger<C: Connection> {
    registry: Arc<ConnectionRegistry<C>>,
}

impl<C: Connection> Logger<C> {
    pub fn new(registry: Arc<ConnectionRegistry<C>>) -> Self {
        Self { registry }
    }

    /// Push one message to every connected client
    pub async fn log(&self, message: impl Into<Payload>) -> BroadcastReport {
        self.registry.broadcast(message.into()).await
    }
}

impl<C: Connection> Clone for Logger<C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}
