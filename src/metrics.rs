//! Process-wide counters, exported through a prometheus registry.
//!
//! Everything is a monotonically increasing atomic; readers take plain
//! loads and no cross-counter snapshot consistency is promised. The same
//! counters back the periodic stats log line, the /status JSON and the
//! /metrics exposition.

use std::time::Instant;

use anyhow::{Context, Result};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use serde::Serialize;

const NAMESPACE: &str = "sflow_enricher";

pub(crate) struct Metrics {
    registry: Registry,
    start_time: Instant,

    pub packets_received: IntCounter,
    pub packets_forwarded: IntCounter,
    pub packets_enriched: IntCounter,
    pub packets_dropped: IntCounter,
    pub packets_filtered: IntCounter,
    pub bytes_received: IntCounter,
    pub bytes_forwarded: IntCounter,
    uptime_seconds: Gauge,

    pub destination_packets_sent: IntCounterVec,
    pub destination_packets_dropped: IntCounterVec,
    pub destination_bytes_sent: IntCounterVec,
    pub destination_healthy: IntGaugeVec,
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .with_context(|| format!("creating counter {name}"))
}

fn destination_counter(name: &str, help: &str) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), &["destination"])
        .with_context(|| format!("creating counter {name}"))
}

impl Metrics {
    pub(crate) fn new() -> Result<Metrics> {
        let metrics = Metrics {
            registry: Registry::new(),
            start_time: Instant::now(),
            packets_received: counter("packets_received_total", "Total packets received")?,
            packets_forwarded: counter("packets_forwarded_total", "Total packets forwarded")?,
            packets_enriched: counter("packets_enriched_total", "Total packets enriched")?,
            packets_dropped: counter("packets_dropped_total", "Total packets dropped")?,
            packets_filtered: counter(
                "packets_filtered_total",
                "Total packets filtered by whitelist",
            )?,
            bytes_received: counter("bytes_received_total", "Total bytes received")?,
            bytes_forwarded: counter("bytes_forwarded_total", "Total bytes forwarded")?,
            uptime_seconds: Gauge::with_opts(
                Opts::new("uptime_seconds", "Uptime in seconds").namespace(NAMESPACE),
            )
            .context("creating uptime gauge")?,
            destination_packets_sent: destination_counter(
                "destination_packets_sent_total",
                "Packets sent to destination",
            )?,
            destination_packets_dropped: destination_counter(
                "destination_packets_dropped_total",
                "Packets dropped for destination",
            )?,
            destination_bytes_sent: destination_counter(
                "destination_bytes_sent_total",
                "Bytes sent to destination",
            )?,
            destination_healthy: IntGaugeVec::new(
                Opts::new("destination_healthy", "Destination health status").namespace(NAMESPACE),
                &["destination"],
            )
            .context("creating health gauge")?,
        };

        for collector in [
            &metrics.packets_received,
            &metrics.packets_forwarded,
            &metrics.packets_enriched,
            &metrics.packets_dropped,
            &metrics.packets_filtered,
            &metrics.bytes_received,
            &metrics.bytes_forwarded,
        ] {
            metrics
                .registry
                .register(Box::new(collector.clone()))
                .context("registering counter")?;
        }
        metrics
            .registry
            .register(Box::new(metrics.uptime_seconds.clone()))
            .context("registering uptime gauge")?;
        for vec in [
            &metrics.destination_packets_sent,
            &metrics.destination_packets_dropped,
            &metrics.destination_bytes_sent,
        ] {
            metrics
                .registry
                .register(Box::new(vec.clone()))
                .context("registering destination counter")?;
        }
        metrics
            .registry
            .register(Box::new(metrics.destination_healthy.clone()))
            .context("registering destination health gauge")?;

        Ok(metrics)
    }

    /// Registry handle for the /metrics encoder; refreshes the uptime gauge
    /// so every scrape sees a current value.
    pub(crate) fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.uptime_seconds.set(self.start_time.elapsed().as_secs_f64());
        self.registry.gather()
    }

    pub(crate) fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.get(),
            packets_forwarded: self.packets_forwarded.get(),
            packets_enriched: self.packets_enriched.get(),
            packets_dropped: self.packets_dropped.get(),
            packets_filtered: self.packets_filtered.get(),
            bytes_received: self.bytes_received.get(),
            bytes_forwarded: self.bytes_forwarded.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub(crate) struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_forwarded: u64,
    pub packets_enriched: u64,
    pub packets_dropped: u64,
    pub packets_filtered: u64,
    pub bytes_received: u64,
    pub bytes_forwarded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_exposition() {
        let metrics = Metrics::new().unwrap();
        metrics.packets_received.inc_by(3);
        metrics.bytes_received.inc_by(1500);
        metrics
            .destination_packets_sent
            .with_label_values(&["primary"])
            .inc();
        metrics
            .destination_healthy
            .with_label_values(&["primary"])
            .set(1);

        let mut buf = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&metrics.gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("sflow_enricher_packets_received_total 3"));
        assert!(text.contains(
            "sflow_enricher_destination_packets_sent_total{destination=\"primary\"} 1"
        ));
        assert!(text.contains("sflow_enricher_destination_healthy{destination=\"primary\"} 1"));
        assert!(text.contains("sflow_enricher_uptime_seconds"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_received, 3);
        assert_eq!(snapshot.bytes_received, 1500);
        assert_eq!(snapshot.packets_dropped, 0);
    }
}
