//! Read-only status surface: Prometheus exposition, JSON status, health.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::forward::Destination;
use crate::metrics::{Metrics, StatsSnapshot};

pub(crate) struct AppState {
    pub metrics: Arc<Metrics>,
    pub destinations: Vec<Arc<Destination>>,
    pub runtime: Arc<RwLock<RuntimeConfig>>,
    pub listen_address: String,
}

pub(crate) async fn serve(
    addr: &str,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding http listener on {addr}"))?;
    tracing::info!("http server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server")
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&state.metrics.gather(), &mut buffer) {
        tracing::error!("encoding metrics failed: {}", err);
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(err) => {
            tracing::error!("metrics are not valid UTF-8: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

#[derive(Serialize)]
struct RuleStatus {
    name: String,
    network: String,
    match_as: u32,
    set_as: u32,
    overwrite: bool,
}

#[derive(Serialize)]
struct DestinationStatus {
    name: String,
    address: String,
    healthy: bool,
    packets_sent: u64,
    packets_dropped: u64,
    bytes_sent: u64,
    last_error: String,
    last_check: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_seconds: u64,
    listen_address: String,
    whitelist_enabled: bool,
    whitelist_sources: Vec<String>,
    enrichment_rules: Vec<RuleStatus>,
    stats: StatsSnapshot,
    destinations: Vec<DestinationStatus>,
}

fn build_status(state: &AppState) -> StatusResponse {
    let (whitelist_enabled, whitelist_sources, enrichment_rules) = match state.runtime.read() {
        Ok(runtime) => (
            runtime.whitelist_enabled,
            runtime.whitelist_sources.clone(),
            runtime
                .rules
                .iter()
                .map(|rule| RuleStatus {
                    name: rule.name.clone(),
                    network: rule.network.to_string(),
                    match_as: rule.match_as,
                    set_as: rule.set_as,
                    overwrite: rule.overwrite,
                })
                .collect(),
        ),
        Err(_) => (false, Vec::new(), Vec::new()),
    };

    let destinations = state
        .destinations
        .iter()
        .map(|destination| {
            let (last_error, last_check) = match destination.state.read() {
                Ok(probe) => (
                    probe.last_error.clone(),
                    probe.last_check.map(|at| at.to_rfc3339()),
                ),
                Err(_) => (String::new(), None),
            };
            DestinationStatus {
                name: destination.name.clone(),
                address: destination.address.clone(),
                healthy: destination.is_healthy(),
                packets_sent: destination.sent(),
                packets_dropped: destination.dropped(),
                bytes_sent: destination.bytes(),
                last_error,
                last_check,
            }
        })
        .collect();

    StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.metrics.uptime_secs(),
        listen_address: state.listen_address.clone(),
        whitelist_enabled,
        whitelist_sources,
        enrichment_rules,
        stats: state.metrics.snapshot(),
        destinations,
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(build_status(&state))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let all_healthy = state.destinations.iter().all(|d| d.is_healthy());
    if all_healthy {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::config::{DestinationConfig, TelegramConfig};
    use crate::forward::setup_destinations;

    async fn test_state() -> Arc<AppState> {
        let metrics = Arc::new(Metrics::new().unwrap());
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let destinations = setup_destinations(
            &[DestinationConfig {
                name: "primary".to_string(),
                address: "127.0.0.1".to_string(),
                port: collector.local_addr().unwrap().port(),
                enabled: true,
                primary: true,
                failover: String::new(),
            }],
            &metrics,
        )
        .await
        .unwrap();

        let runtime = Arc::new(RwLock::new(RuntimeConfig {
            rules: vec![crate::enrichment::EnrichmentRule {
                name: "own".to_string(),
                network: "10.0.0.0/24".parse().unwrap(),
                match_as: 64500,
                set_as: 65001,
                overwrite: false,
            }],
            whitelist_enabled: true,
            whitelist_sources: vec!["192.0.2.1".to_string()],
            whitelist_nets: Vec::new(),
            telegram: TelegramConfig::default(),
            log_level: "info".to_string(),
        }));

        Arc::new(AppState {
            metrics,
            destinations,
            runtime,
            listen_address: "0.0.0.0:6343".to_string(),
        })
    }

    #[tokio::test]
    async fn status_reports_rules_stats_and_destinations() {
        let state = test_state().await;
        state.metrics.packets_received.inc_by(5);

        let status = build_status(&state);
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(status.listen_address, "0.0.0.0:6343");
        assert!(status.whitelist_enabled);
        assert_eq!(status.enrichment_rules.len(), 1);
        assert_eq!(status.enrichment_rules[0].network, "10.0.0.0/24");
        assert_eq!(status.stats.packets_received, 5);
        assert_eq!(status.destinations.len(), 1);
        assert!(status.destinations[0].healthy);

        let body = serde_json::to_value(&status).unwrap();
        assert_eq!(body["stats"]["packets_received"], 5);
        assert_eq!(body["destinations"][0]["name"], "primary");
    }

    #[tokio::test]
    async fn health_flips_to_503_when_any_destination_is_down() {
        let state = test_state().await;

        let response = health_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        state.destinations[0].healthy.store(false, Ordering::Relaxed);
        let response = health_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_handler_renders_the_registry() {
        let state = test_state().await;
        state.metrics.packets_received.inc();

        let response = metrics_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("sflow_enricher_packets_received_total 1"));
    }
}
