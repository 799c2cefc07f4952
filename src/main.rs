//! sflow-enricher: a transparent sFlow v5 relay that rewrites BGP AS
//! attribution inside Extended Gateway records before fanning datagrams out
//! to the configured collectors.

mod config;
mod decoder;
mod enrichment;
mod forward;
mod http;
mod ingest;
mod metrics;
mod notify;
mod sdnotify;
#[cfg(test)]
mod testkit;
mod udp;
mod xdr;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::config::Config;
use crate::forward::Destination;
use crate::metrics::Metrics;
use crate::notify::Notifier;

#[derive(Parser)]
#[command(name = "sflow-enricher", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "/etc/sflow-enricher/config.yaml")]
    config: PathBuf,

    /// Force debug logging regardless of the configured level.
    #[arg(long)]
    debug: bool,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Installs the subscriber and returns a handle through which SIGHUP can
/// swap the level filter without restarting.
fn init_tracing(level: &str, format: &str) -> Result<FilterHandle> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level {level}"))?;
    let (filter, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(handle)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    let level = if cli.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter_handle = init_tracing(level, &config.logging.format)?;

    tracing::info!(
        "sflow-enricher v{} starting, config {}",
        env!("CARGO_PKG_VERSION"),
        cli.config.display()
    );
    tracing::info!(
        "listen {}, {} enrichment rules",
        config.listen_addr(),
        config.enrichment.rules.len()
    );
    for rule in &config.enrichment.rules {
        tracing::info!(
            "rule {}: {} match_as={} set_as={} overwrite={}",
            rule.name,
            rule.network,
            rule.match_as,
            rule.set_as,
            rule.overwrite
        );
    }

    let runtime = Arc::new(RwLock::new(config.runtime()?));
    let metrics = Arc::new(Metrics::new()?);
    let notifier = Notifier::new(Arc::clone(&runtime))?;

    let destinations = forward::setup_destinations(&config.destinations, &metrics).await?;
    let relay = ingest::Relay::bind(
        &config.listen_addr(),
        destinations.clone(),
        Arc::clone(&runtime),
        Arc::clone(&metrics),
    )
    .await?;

    let shutdown = CancellationToken::new();

    if config.http.enabled {
        let state = Arc::new(http::AppState {
            metrics: Arc::clone(&metrics),
            destinations: destinations.clone(),
            runtime: Arc::clone(&runtime),
            listen_address: config.listen_addr(),
        });
        let addr = config.http_addr();
        let http_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = http::serve(&addr, state, http_shutdown).await {
                tracing::error!("http server failed: {:#}", err);
            }
        });
    }

    tokio::spawn(forward::run_health_prober(
        destinations.clone(),
        Arc::clone(&notifier),
        shutdown.clone(),
    ));
    tokio::spawn(ingest::run_stats_reporter(
        Arc::clone(&metrics),
        Arc::clone(&runtime),
        Arc::clone(&notifier),
        config.logging.stats_interval,
        shutdown.clone(),
    ));

    let relay_task = tokio::spawn(relay.run(shutdown.clone()));

    sdnotify::ready();
    sdnotify::spawn_watchdog(shutdown.clone());
    notifier.send("startup", startup_message(&config));

    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, reloading configuration");
                match config::reload(&cli.config, &runtime) {
                    Ok(rule_count) => {
                        if let Err(err) = notifier.reconfigure() {
                            tracing::warn!("rebuilding notifier clients failed: {:#}", err);
                        }
                        if !cli.debug {
                            apply_log_level(&filter_handle, &runtime);
                        }
                        tracing::info!("configuration reloaded, {} rules active", rule_count);
                    }
                    Err(err) => {
                        tracing::error!(
                            "config reload failed, previous configuration stays active: {:#}",
                            err
                        );
                    }
                }
            }
        }
    }

    sdnotify::stopping();
    notifier
        .send_blocking("shutdown", shutdown_message(&metrics, &destinations))
        .await;

    shutdown.cancel();
    match relay_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!("ingress loop error: {:#}", err),
        Err(err) if !err.is_cancelled() => tracing::error!("ingress task join error: {}", err),
        Err(_) => {}
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        "final stats: uptime={}s received={} forwarded={} enriched={} dropped={} filtered={} bytes_in={} bytes_out={}",
        metrics.uptime_secs(),
        snapshot.packets_received,
        snapshot.packets_forwarded,
        snapshot.packets_enriched,
        snapshot.packets_dropped,
        snapshot.packets_filtered,
        snapshot.bytes_received,
        snapshot.bytes_forwarded,
    );

    Ok(())
}

fn apply_log_level(handle: &FilterHandle, runtime: &RwLock<config::RuntimeConfig>) {
    let Ok(level) = runtime.read().map(|guard| guard.log_level.clone()) else {
        return;
    };
    match EnvFilter::try_new(&level) {
        Ok(filter) => {
            if let Err(err) = handle.reload(filter) {
                tracing::warn!("applying log level {} failed: {}", level, err);
            }
        }
        Err(err) => tracing::warn!("ignoring invalid log level {}: {}", level, err),
    }
}

fn startup_message(config: &Config) -> String {
    let mut message = format!("*Listen:* `{}`\n", config.listen_addr());

    message.push_str("\n*Enrichment Rules:*");
    for rule in &config.enrichment.rules {
        message.push_str(&format!(
            "\n   - `{}` -> AS{} ({})",
            rule.name, rule.set_as, rule.network
        ));
    }
    message.push_str("\n   _Out(srcIP): SrcAS, SrcPeerAS, RouterAS_");
    message.push_str("\n   _In(dstIP): DstAS, RouterAS_\n");

    message.push_str("\n*Destinations:*");
    for destination in config.destinations.iter().filter(|d| d.enabled) {
        message.push_str(&format!(
            "\n   - `{}` ({}:{})",
            destination.name, destination.address, destination.port
        ));
    }
    message.push('\n');

    message.push_str("\n*sFlow Sources:*");
    for source in &config.security.whitelist_sources {
        message.push_str(&format!("\n   - `{source}`"));
    }

    message
}

fn shutdown_message(metrics: &Metrics, destinations: &[Arc<Destination>]) -> String {
    let snapshot = metrics.snapshot();
    let enrich_pct = if snapshot.packets_received > 0 {
        snapshot.packets_enriched as f64 / snapshot.packets_received as f64 * 100.0
    } else {
        0.0
    };

    let mut message = format!("*Uptime:* `{}s`\n", metrics.uptime_secs());
    message.push_str("\n*Stats:*");
    message.push_str(&format!("\n   Received: `{}`", snapshot.packets_received));
    message.push_str(&format!(
        "\n   Enriched: `{}` ({enrich_pct:.1}%)",
        snapshot.packets_enriched
    ));
    message.push_str(&format!("\n   Forwarded: `{}`", snapshot.packets_forwarded));
    message.push_str(&format!("\n   Dropped: `{}`\n", snapshot.packets_dropped));

    message.push_str("\n*Destinations:*");
    for destination in destinations {
        let status = if destination.is_healthy() { "up" } else { "down" };
        message.push_str(&format!(
            "\n   [{}] `{}`: {} pkts, {}",
            status,
            destination.name,
            destination.sent(),
            format_bytes(destination.bytes())
        ));
    }

    message
}

fn format_bytes(bytes: u64) -> String {
    match bytes {
        1_000_000_000.. => format!("{:.1} GB", bytes as f64 / 1_000_000_000.0),
        1_000_000.. => format!("{:.1} MB", bytes as f64 / 1_000_000.0),
        1_000.. => format!("{:.1} KB", bytes as f64 / 1_000.0),
        _ => format!("{bytes} B"),
    }
}
