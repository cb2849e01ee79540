//! Metrics Collector

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use tracing::error;

use crate::connection::BroadcastReport;
use crate::Result;

/// Collects and exports server metrics
pub struct Metrics {
    prometheus_registry: Registry,

    connections_total: IntCounter,
    active_connections: IntGauge,
    broadcasts_total: IntCounter,
    sends_delivered_total: IntCounter,
    sends_failed_total: IntCounter,
    sends_timed_out_total: IntCounter,
    evictions_total: IntCounter,
}

impl Metrics {
    /// Create a new metrics collector with its own Prometheus registry
    pub fn new() -> Result<Self> {
        let prometheus_registry = Registry::new();

        let connections_total = IntCounter::new(
            "telecast_connections_total",
            "Total number of registered client connections",
        )?;
        let active_connections = IntGauge::new(
            "telecast_active_connections",
            "Number of currently registered client connections",
        )?;
        let broadcasts_total = IntCounter::new(
            "telecast_broadcasts_total",
            "Total number of broadcasts performed",
        )?;
        let sends_delivered_total = IntCounter::new(
            "telecast_sends_delivered_total",
            "Total payloads handed to client connections",
        )?;
        let sends_failed_total = IntCounter::new(
            "telecast_sends_failed_total",
            "Total per-connection sends that failed",
        )?;
        let sends_timed_out_total = IntCounter::new(
            "telecast_sends_timed_out_total",
            "Total per-connection sends that exceeded the send timeout",
        )?;
        let evictions_total = IntCounter::new(
            "telecast_evictions_total",
            "Total connections evicted after a failed send",
        )?;

        prometheus_registry.register(Box::new(connections_total.clone()))?;
        prometheus_registry.register(Box::new(active_connections.clone()))?;
        prometheus_registry.register(Box::new(broadcasts_total.clone()))?;
        prometheus_registry.register(Box::new(sends_delivered_total.clone()))?;
        prometheus_registry.register(Box::new(sends_failed_total.clone()))?;
        prometheus_registry.register(Box::new(sends_timed_out_total.clone()))?;
        prometheus_registry.register(Box::new(evictions_total.clone()))?;

        Ok(Self {
            prometheus_registry,
            connections_total,
            active_connections,
            broadcasts_total,
            sends_delivered_total,
            sends_failed_total,
            sends_timed_out_total,
            evictions_total,
        })
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    /// Fold one broadcast outcome into the counters
    pub fn record_broadcast(&self, report: &BroadcastReport) {
        self.broadcasts_total.inc();
        self.sends_delivered_total.inc_by(report.delivered as u64);
        self.sends_failed_total.inc_by(report.failed as u64);
        self.sends_timed_out_total.inc_by(report.timed_out as u64);
        self.evictions_total.inc_by(report.evicted as u64);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus_registry.gather();
        match encoder.encode_to_string(&metric_families) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.get()
    }

    pub fn total_connections(&self) -> u64 {
        self.connections_total.get()
    }

    pub fn broadcasts(&self) -> u64 {
        self.broadcasts_total.get()
    }

    pub fn sends_delivered(&self) -> u64 {
        self.sends_delivered_total.get()
    }

    pub fn sends_failed(&self) -> u64 {
        self.sends_failed_total.get()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions_total.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_broadcast() {
        let metrics = Metrics::new().unwrap();
        metrics.record_broadcast(&BroadcastReport {
            recipients: 3,
            delivered: 2,
            failed: 1,
            timed_out: 1,
            evicted: 0,
        });

        assert_eq!(metrics.broadcasts(), 1);
        assert_eq!(metrics.sends_delivered(), 2);
        assert_eq!(metrics.sends_failed(), 1);
        assert_eq!(metrics.evictions(), 0);
    }

    #[test]
    fn test_export_contains_metric_names() {
        let metrics = Metrics::new().unwrap();
        metrics.connection_opened();

        let text = metrics.export_prometheus();
        assert!(text.contains("telecast_active_connections 1"));
        assert!(text.contains("telecast_connections_total 1"));
    }
}
