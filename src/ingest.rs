//! Ingress loop: receive, whitelist, enrich, fan out.
//!
//! One task owns the ingress socket. The receive buffer is reused across
//! iterations; each accepted packet is copied out before processing because
//! enrichment may reallocate the buffer and the pipeline must never hold
//! the receive buffer across an await.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::enrichment;
use crate::forward::{self, Destination};
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::udp;

const MAX_PACKET_SIZE: usize = 65535;
const RECEIVE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Minimum packets per interval before the drop ratio is meaningful.
const DROP_RATE_MIN_PACKETS: u64 = 100;

pub(crate) struct Relay {
    socket: UdpSocket,
    destinations: Vec<Arc<Destination>>,
    runtime: Arc<RwLock<RuntimeConfig>>,
    metrics: Arc<Metrics>,
}

impl Relay {
    pub(crate) async fn bind(
        listen: &str,
        destinations: Vec<Arc<Destination>>,
        runtime: Arc<RwLock<RuntimeConfig>>,
        metrics: Arc<Metrics>,
    ) -> Result<Relay> {
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("binding ingress socket on {listen}"))?;
        if let Err(err) = udp::set_receive_buffer_size(&socket, RECEIVE_BUFFER_BYTES) {
            tracing::warn!("set receive buffer size failed: {}", err);
        }
        tracing::info!("listening on {}", socket.local_addr()?);

        Ok(Relay {
            socket,
            destinations,
            runtime,
            metrics,
        })
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("reading ingress address")
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let (received, source) = tokio::select! {
                _ = shutdown.cancelled() => break,
                recv = self.socket.recv_from(&mut buffer) => match recv {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!("udp recv error: {}", err);
                        continue;
                    }
                },
            };

            self.metrics.packets_received.inc();
            self.metrics.bytes_received.inc_by(received as u64);

            let rules = {
                let Ok(runtime) = self.runtime.read() else {
                    continue;
                };
                if !runtime.is_whitelisted(source.ip()) {
                    self.metrics.packets_filtered.inc();
                    tracing::debug!("filtered packet from {}", source.ip());
                    continue;
                }
                runtime.rules.clone()
            };

            let packet = buffer[..received].to_vec();
            let (packet, enriched) = enrichment::enrich(packet, &rules);
            if enriched {
                self.metrics.packets_enriched.inc();
            }

            for destination in &self.destinations {
                forward::send(destination, &packet, &self.metrics).await;
            }
        }

        Ok(())
    }
}

/// The interval drop ratio in percent, or `None` below the minimum sample
/// size.
fn drop_rate(delta_received: u64, delta_dropped: u64) -> Option<f64> {
    if delta_received < DROP_RATE_MIN_PACKETS {
        return None;
    }
    Some(delta_dropped as f64 / delta_received as f64 * 100.0)
}

/// Logs a counter snapshot every `interval_secs` and raises a rate-limited
/// high_drop_rate alert when the interval's drop ratio crosses the
/// configured threshold.
pub(crate) async fn run_stats_reporter(
    metrics: Arc<Metrics>,
    runtime: Arc<RwLock<RuntimeConfig>>,
    notifier: Arc<Notifier>,
    interval_secs: u64,
    shutdown: CancellationToken,
) {
    let interval_secs = if interval_secs == 0 { 60 } else { interval_secs };
    let mut tick = tokio::time::interval(Duration::from_secs(interval_secs));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    let mut prev_received = metrics.packets_received.get();
    let mut prev_dropped = metrics.packets_dropped.get();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let snapshot = metrics.snapshot();
                tracing::info!(
                    "stats: received={} forwarded={} enriched={} dropped={} filtered={} bytes_in={} bytes_out={}",
                    snapshot.packets_received,
                    snapshot.packets_forwarded,
                    snapshot.packets_enriched,
                    snapshot.packets_dropped,
                    snapshot.packets_filtered,
                    snapshot.bytes_received,
                    snapshot.bytes_forwarded,
                );

                let delta_received = snapshot.packets_received - prev_received;
                let delta_dropped = snapshot.packets_dropped - prev_dropped;
                prev_received = snapshot.packets_received;
                prev_dropped = snapshot.packets_dropped;

                let threshold = match runtime.read() {
                    Ok(guard) => guard.telegram.drop_rate_threshold,
                    Err(_) => continue,
                };
                if let Some(rate) = drop_rate(delta_received, delta_dropped)
                    && rate >= threshold
                {
                    tracing::error!(
                        "high drop rate: {:.1}% (threshold {:.1}%), {} received / {} dropped this interval",
                        rate,
                        threshold,
                        delta_received,
                        delta_dropped,
                    );
                    let message = format!(
                        "*Drop rate:* `{:.1}%` (threshold: `{:.1}%`)\n\n*Interval:* `{}` received, `{}` dropped\n\n*Totals:* `{}` received, `{}` dropped",
                        rate,
                        threshold,
                        delta_received,
                        delta_dropped,
                        snapshot.packets_received,
                        snapshot.packets_dropped,
                    );
                    notifier
                        .send_rate_limited("high_drop_rate", "global", message)
                        .await;
                }
            }
        }
    }
}
