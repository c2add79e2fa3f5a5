//! Prometheus metrics for the LoRa adapter
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.

use std::time::Duration;

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

mod server;

pub use server::MetricsServer;

/// All adapter metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Relay metrics
    pub uplinks_received: IntCounter,
    pub uplinks_relayed: IntCounter,
    pub uplinks_dropped: IntCounterVec,
    pub relayed_bytes: IntCounter,
    pub relay_latency: Histogram,

    // Broker session metrics
    pub broker_connected: IntGaugeVec,
    pub broker_connection_lost: IntCounterVec,
    pub broker_reconnects: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let uplinks_received = IntCounter::with_opts(Opts::new(
            "lora_adapter_uplinks_received_total",
            "Total uplink messages received from the sensor-network broker",
        ))
        .unwrap();

        let uplinks_relayed = IntCounter::with_opts(Opts::new(
            "lora_adapter_uplinks_relayed_total",
            "Total decoded uplinks published to the platform broker",
        ))
        .unwrap();

        let uplinks_dropped = IntCounterVec::new(
            Opts::new(
                "lora_adapter_uplinks_dropped_total",
                "Total uplinks dropped, by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let relayed_bytes = IntCounter::with_opts(Opts::new(
            "lora_adapter_relayed_bytes_total",
            "Total decoded payload bytes published to the platform broker",
        ))
        .unwrap();

        let relay_latency = Histogram::with_opts(
            HistogramOpts::new(
                "lora_adapter_relay_latency_seconds",
                "Time to decode an uplink and complete the platform publish",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )
        .unwrap();

        let broker_connected = IntGaugeVec::new(
            Opts::new(
                "lora_adapter_broker_connected",
                "Whether the broker session is connected (1) or not (0)",
            ),
            &["broker"],
        )
        .unwrap();

        let broker_connection_lost = IntCounterVec::new(
            Opts::new(
                "lora_adapter_broker_connection_lost_total",
                "Total connection losses per broker session",
            ),
            &["broker"],
        )
        .unwrap();

        let broker_reconnects = IntCounterVec::new(
            Opts::new(
                "lora_adapter_broker_reconnects_total",
                "Total successful reconnects per broker session",
            ),
            &["broker"],
        )
        .unwrap();

        registry
            .register(Box::new(uplinks_received.clone()))
            .unwrap();
        registry
            .register(Box::new(uplinks_relayed.clone()))
            .unwrap();
        registry
            .register(Box::new(uplinks_dropped.clone()))
            .unwrap();
        registry.register(Box::new(relayed_bytes.clone())).unwrap();
        registry.register(Box::new(relay_latency.clone())).unwrap();
        registry
            .register(Box::new(broker_connected.clone()))
            .unwrap();
        registry
            .register(Box::new(broker_connection_lost.clone()))
            .unwrap();
        registry
            .register(Box::new(broker_reconnects.clone()))
            .unwrap();

        Metrics {
            registry,
            uplinks_received,
            uplinks_relayed,
            uplinks_dropped,
            relayed_bytes,
            relay_latency,
            broker_connected,
            broker_connection_lost,
            broker_reconnects,
        }
    }

    // Relay helpers

    pub fn uplink_received(&self) {
        self.uplinks_received.inc();
    }

    pub fn uplink_relayed(&self, bytes: usize, elapsed: Duration) {
        self.uplinks_relayed.inc();
        self.relayed_bytes.inc_by(bytes as u64);
        self.relay_latency.observe(elapsed.as_secs_f64());
    }

    pub fn uplink_dropped(&self, reason: &str) {
        self.uplinks_dropped.with_label_values(&[reason]).inc();
    }

    // Broker session helpers

    pub fn broker_up(&self, broker: &str, reconnected: bool) {
        self.broker_connected.with_label_values(&[broker]).set(1);
        if reconnected {
            self.broker_reconnects.with_label_values(&[broker]).inc();
        }
    }

    pub fn broker_down(&self, broker: &str) {
        self.broker_connected.with_label_values(&[broker]).set(0);
        self.broker_connection_lost
            .with_label_values(&[broker])
            .inc();
    }

    pub fn broker_closed(&self, broker: &str) {
        self.broker_connected.with_label_values(&[broker]).set(0);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_relay_counters() {
        let metrics = Metrics::new();
        metrics.uplink_received();
        metrics.uplink_received();
        metrics.uplink_relayed(5, Duration::from_millis(2));
        metrics.uplink_dropped("decode");

        assert_eq!(metrics.uplinks_received.get(), 2);
        assert_eq!(metrics.uplinks_relayed.get(), 1);
        assert_eq!(metrics.relayed_bytes.get(), 5);
        assert_eq!(
            metrics.uplinks_dropped.with_label_values(&["decode"]).get(),
            1
        );
        assert_eq!(metrics.relay_latency.get_sample_count(), 1);
    }

    #[test]
    fn test_broker_gauges() {
        let metrics = Metrics::new();
        metrics.broker_up("lora", false);
        assert_eq!(metrics.broker_connected.with_label_values(&["lora"]).get(), 1);

        metrics.broker_down("lora");
        assert_eq!(metrics.broker_connected.with_label_values(&["lora"]).get(), 0);

        metrics.broker_up("lora", true);
        assert_eq!(
            metrics.broker_reconnects.with_label_values(&["lora"]).get(),
            1
        );
        assert_eq!(
            metrics
                .broker_connection_lost
                .with_label_values(&["lora"])
                .get(),
            1
        );
    }

    #[test]
    fn test_gather_exposes_names() {
        let metrics = Metrics::new();
        metrics.uplink_dropped("parse");
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("lora_adapter_uplinks_dropped_total{reason=\"parse\"} 1"));
        assert!(text.contains("lora_adapter_uplinks_received_total 0"));
    }
}
