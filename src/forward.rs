//! Destination table, failover wiring and fan-out.
//!
//! Each destination owns one connected egress socket opened at startup. A
//! failover peer is a non-owning back-reference resolved by name once the
//! whole table exists; the table owns every destination exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use prometheus::{IntCounter, IntGauge};
use tokio::net::{UdpSocket, lookup_host};
use tokio_util::sync::CancellationToken;

use crate::config::DestinationConfig;
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::udp;

const SEND_BUFFER_BYTES: usize = 2 * 1024 * 1024;
const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub(crate) struct ProbeState {
    pub last_error: String,
    pub last_check: Option<DateTime<Utc>>,
}

pub(crate) struct Destination {
    pub name: String,
    /// The configured "host:port", kept for probing and reporting.
    pub address: String,
    socket: UdpSocket,
    pub healthy: AtomicBool,
    pub state: RwLock<ProbeState>,
    failover: OnceLock<Weak<Destination>>,

    packets_sent: IntCounter,
    packets_dropped: IntCounter,
    bytes_sent: IntCounter,
    healthy_gauge: IntGauge,
}

impl Destination {
    pub(crate) fn failover_peer(&self) -> Option<Arc<Destination>> {
        self.failover.get().and_then(Weak::upgrade)
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub(crate) fn sent(&self) -> u64 {
        self.packets_sent.get()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.packets_dropped.get()
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes_sent.get()
    }
}

/// Opens one connected socket per enabled destination and wires failover
/// peers. Zero enabled destinations is a startup error: a relay with
/// nowhere to forward is misconfigured.
pub(crate) async fn setup_destinations(
    configs: &[DestinationConfig],
    metrics: &Metrics,
) -> Result<Vec<Arc<Destination>>> {
    let mut destinations = Vec::new();

    for config in configs.iter().filter(|c| c.enabled) {
        let address = format!("{}:{}", config.address, config.port);
        let remote: SocketAddr = lookup_host(&address)
            .await
            .with_context(|| format!("resolving destination {}", config.name))?
            .next()
            .with_context(|| format!("destination {} resolved to no addresses", config.name))?;

        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("binding egress socket for {}", config.name))?;
        if let Err(err) = udp::set_send_buffer_size(&socket, SEND_BUFFER_BYTES) {
            tracing::warn!("set send buffer size for {} failed: {}", config.name, err);
        }
        socket
            .connect(remote)
            .await
            .with_context(|| format!("connecting to destination {}", config.name))?;

        let destination = Arc::new(Destination {
            name: config.name.clone(),
            address,
            socket,
            healthy: AtomicBool::new(true),
            state: RwLock::new(ProbeState::default()),
            failover: OnceLock::new(),
            packets_sent: metrics
                .destination_packets_sent
                .with_label_values(&[config.name.as_str()]),
            packets_dropped: metrics
                .destination_packets_dropped
                .with_label_values(&[config.name.as_str()]),
            bytes_sent: metrics
                .destination_bytes_sent
                .with_label_values(&[config.name.as_str()]),
            healthy_gauge: metrics
                .destination_healthy
                .with_label_values(&[config.name.as_str()]),
        });
        destination.healthy_gauge.set(1);

        tracing::info!(
            "destination {} configured ({}, primary={})",
            destination.name,
            destination.address,
            config.primary
        );
        destinations.push(destination);
    }

    if destinations.is_empty() {
        bail!("no enabled destinations configured");
    }

    for config in configs.iter().filter(|c| c.enabled && !c.failover.is_empty()) {
        let Some(peer) = destinations.iter().find(|d| d.name == config.failover) else {
            tracing::warn!(
                "destination {} names unknown failover {}",
                config.name,
                config.failover
            );
            continue;
        };
        let peer = Arc::downgrade(peer);
        if let Some(destination) = destinations.iter().find(|d| d.name == config.name) {
            let _ = destination.failover.set(peer);
            tracing::info!(
                "failover configured: {} -> {}",
                config.name,
                config.failover
            );
        }
    }

    Ok(destinations)
}

/// Sends one datagram towards `destination`, diverting to its failover peer
/// when the destination is down and the peer is up. Write errors are
/// counted and remembered, never retried; health is the prober's concern.
pub(crate) async fn send(destination: &Arc<Destination>, packet: &[u8], metrics: &Metrics) {
    let target = if !destination.is_healthy()
        && let Some(peer) = destination.failover_peer()
        && peer.is_healthy()
    {
        tracing::debug!("diverting {} traffic to failover {}", destination.name, peer.name);
        peer
    } else {
        Arc::clone(destination)
    };

    match target.socket.send(packet).await {
        Ok(sent) => {
            target.packets_sent.inc();
            target.bytes_sent.inc_by(sent as u64);
            metrics.packets_forwarded.inc();
            metrics.bytes_forwarded.inc_by(sent as u64);
        }
        Err(err) => {
            target.packets_dropped.inc();
            metrics.packets_dropped.inc();
            if let Ok(mut state) = target.state.write() {
                state.last_error = err.to_string();
                state.last_check = Some(Utc::now());
            }
            tracing::debug!("forward to {} failed: {}", target.name, err);
        }
    }
}

/// Periodically probes every destination with a short-lived resolve +
/// connect. Health transitions are edge-triggered: only a state change
/// logs and alerts.
pub(crate) async fn run_health_prober(
    destinations: Vec<Arc<Destination>>,
    notifier: Arc<Notifier>,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(PROBE_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so startup alerts settle
    // before the first probe round.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                for destination in &destinations {
                    probe_destination(destination, &notifier).await;
                }
            }
        }
    }
}

async fn probe_destination(destination: &Arc<Destination>, notifier: &Arc<Notifier>) {
    let was_healthy = destination.is_healthy();

    let result = tokio::time::timeout(PROBE_TIMEOUT, async {
        let remote = lookup_host(&destination.address)
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "resolved to no addresses")
            })?;
        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await
    })
    .await;
    let outcome = match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!("probe timed out after {PROBE_TIMEOUT:?}")),
    };

    match outcome {
        Ok(()) => {
            destination.healthy.store(true, Ordering::Relaxed);
            destination.healthy_gauge.set(1);
            if let Ok(mut state) = destination.state.write() {
                state.last_error.clear();
                state.last_check = Some(Utc::now());
            }
            if !was_healthy {
                tracing::info!("destination {} healthy again", destination.name);
                let message = format!(
                    "*Destination:* `{}` (`{}`)\n*Status:* UP\n\nRecovered",
                    destination.name, destination.address
                );
                notifier
                    .send_rate_limited("destination_up", &destination.name, message)
                    .await;
            }
        }
        Err(error) => {
            destination.healthy.store(false, Ordering::Relaxed);
            destination.healthy_gauge.set(0);
            if let Ok(mut state) = destination.state.write() {
                state.last_error = error.clone();
                state.last_check = Some(Utc::now());
            }
            if was_healthy {
                tracing::error!("destination {} unhealthy: {}", destination.name, error);
                let message = format!(
                    "*Destination:* `{}` (`{}`)\n*Status:* DOWN\n\n*Error:* `{}`\n\n*Sent before failure:* {} pkts",
                    destination.name,
                    destination.address,
                    error,
                    destination.sent()
                );
                notifier
                    .send_rate_limited("destination_down", &destination.name, message)
                    .await;
            }
        }
    }
}
