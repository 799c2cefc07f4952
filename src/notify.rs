//! Telegram alert channel.
//!
//! Strictly a best-effort sink: delivery failures are logged and never
//! propagated, and nothing here may block the ingress path. Non-shutdown
//! alerts are fired from short-lived tasks; the shutdown alert is awaited
//! under a fixed budget so the process can still exit promptly.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::json;

use crate::config::{RuntimeConfig, TelegramConfig};

const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);
const IPV6_ALERT_COOLDOWN: Duration = Duration::from_secs(3600);
const IPV4_FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Clients {
    primary: reqwest::Client,
    /// IPv4-bound client used for fallback delivery and for the
    /// degradation alert itself, so that alert cannot recurse through the
    /// IPv6-first path.
    ipv4: reqwest::Client,
    ipv6_first: bool,
}

pub(crate) struct Notifier {
    runtime: Arc<RwLock<RuntimeConfig>>,
    clients: Mutex<Clients>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    last_ipv6_alert: Mutex<Option<Instant>>,
}

fn build_clients(telegram: &TelegramConfig) -> Result<Clients> {
    let timeout = Duration::from_secs(telegram.http_timeout);
    let ipv4 = reqwest::Client::builder()
        .timeout(IPV4_FALLBACK_TIMEOUT)
        .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        .build()
        .context("building IPv4 telegram client")?;

    let primary = if telegram.ipv6_fallback {
        reqwest::Client::builder()
            .timeout(timeout)
            .local_address(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
            .build()
            .context("building IPv6-first telegram client")?
    } else {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building telegram client")?
    };

    Ok(Clients {
        primary,
        ipv4,
        ipv6_first: telegram.ipv6_fallback,
    })
}

fn alert_enabled(telegram: &TelegramConfig, kind: &str) -> bool {
    telegram.enabled && telegram.alert_on.iter().any(|enabled| enabled == kind)
}

/// Returns the remaining cooldown for `key`, or records `now` as the new
/// send time and returns `None`.
fn check_cooldown(
    cooldowns: &mut HashMap<String, Instant>,
    key: String,
    now: Instant,
    cooldown: Duration,
) -> Option<Duration> {
    if let Some(last) = cooldowns.get(&key) {
        let elapsed = now.duration_since(*last);
        if elapsed < cooldown {
            return Some(cooldown - elapsed);
        }
    }
    cooldowns.insert(key, now);
    None
}

impl Notifier {
    pub(crate) fn new(runtime: Arc<RwLock<RuntimeConfig>>) -> Result<Arc<Notifier>> {
        let clients = {
            let guard = runtime
                .read()
                .map_err(|_| anyhow::anyhow!("runtime config lock poisoned"))?;
            build_clients(&guard.telegram)?
        };
        Ok(Arc::new(Notifier {
            runtime,
            clients: Mutex::new(clients),
            cooldowns: Mutex::new(HashMap::new()),
            last_ipv6_alert: Mutex::new(None),
        }))
    }

    /// Rebuilds the HTTP clients from the current runtime config; called
    /// after a successful reload.
    pub(crate) fn reconfigure(&self) -> Result<()> {
        let next = {
            let guard = self
                .runtime
                .read()
                .map_err(|_| anyhow::anyhow!("runtime config lock poisoned"))?;
            build_clients(&guard.telegram)?
        };
        if let Ok(mut clients) = self.clients.lock() {
            *clients = next;
        }
        Ok(())
    }

    /// Fire-and-forget delivery from a short-lived task.
    pub(crate) fn send(self: &Arc<Self>, kind: &'static str, message: String) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            notifier.deliver(kind, message).await;
        });
    }

    /// Awaited delivery with a hard budget; used for the shutdown alert.
    pub(crate) async fn send_blocking(&self, kind: &str, message: String) {
        if tokio::time::timeout(SHUTDOWN_BUDGET, self.deliver(kind, message))
            .await
            .is_err()
        {
            tracing::warn!("{} alert delivery exceeded shutdown budget", kind);
        }
    }

    /// Sends unless the same (kind, key) fired inside the flap cooldown.
    pub(crate) async fn send_rate_limited(
        self: &Arc<Self>,
        kind: &'static str,
        key: &str,
        message: String,
    ) {
        let cooldown = {
            let Ok(guard) = self.runtime.read() else { return };
            Duration::from_secs(guard.telegram.flap_cooldown)
        };

        let remaining = match self.cooldowns.lock() {
            Ok(mut cooldowns) => check_cooldown(
                &mut cooldowns,
                format!("{kind}:{key}"),
                Instant::now(),
                cooldown,
            ),
            Err(_) => return,
        };

        if let Some(remaining) = remaining {
            tracing::info!(
                "{} alert for {} suppressed, cooldown {}s left",
                kind,
                key,
                remaining.as_secs()
            );
            return;
        }

        self.send(kind, message);
    }

    async fn deliver(&self, kind: &str, message: String) {
        let (telegram, clients) = {
            let Ok(guard) = self.runtime.read() else { return };
            if !alert_enabled(&guard.telegram, kind) {
                return;
            }
            let Ok(clients) = self.clients.lock() else { return };
            (guard.telegram.clone(), clients.clone())
        };

        tracing::info!("sending {} notification", kind);
        let body = format_alert(kind, &message);

        match self.post(&clients.primary, &telegram, &body).await {
            Ok(()) => return,
            Err(err) if clients.ipv6_first && err.is_connect() => {
                tracing::info!("IPv6 delivery failed, falling back to IPv4: {}", err);
                self.maybe_ipv6_degraded_alert(&clients.ipv4, &telegram);
            }
            Err(err) => {
                tracing::warn!("telegram delivery failed: {}", err);
                return;
            }
        }

        if let Err(err) = self.post(&clients.ipv4, &telegram, &body).await {
            tracing::warn!("telegram IPv4 fallback delivery failed: {}", err);
        }
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        telegram: &TelegramConfig,
        text: &str,
    ) -> std::result::Result<(), reqwest::Error> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            telegram.bot_token
        );
        let response = client
            .post(&url)
            .json(&json!({
                "chat_id": telegram.chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::warn!("telegram API returned status {}", response.status());
        }
        Ok(())
    }

    /// Reports IPv6 degradation at most once an hour, through the IPv4
    /// client only.
    fn maybe_ipv6_degraded_alert(&self, ipv4: &reqwest::Client, telegram: &TelegramConfig) {
        let due = match self.last_ipv6_alert.lock() {
            Ok(mut last) => {
                let now = Instant::now();
                let due = last.is_none_or(|at| now.duration_since(at) >= IPV6_ALERT_COOLDOWN);
                if due {
                    *last = Some(now);
                }
                due
            }
            Err(_) => false,
        };
        if !due {
            return;
        }

        let body = format_alert(
            "ipv6_degraded",
            "IPv6 connectivity to the Telegram API failed, using IPv4 fallback",
        );
        let client = ipv4.clone();
        let telegram = telegram.clone();
        tokio::spawn(async move {
            let url = format!(
                "https://api.telegram.org/bot{}/sendMessage",
                telegram.bot_token
            );
            let result = client
                .post(&url)
                .json(&json!({
                    "chat_id": telegram.chat_id,
                    "text": body,
                    "parse_mode": "Markdown",
                }))
                .send()
                .await;
            if let Err(err) = result {
                tracing::warn!("failed to send IPv6 degradation alert: {}", err);
            }
        });
    }
}

fn format_alert(kind: &str, message: &str) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    format!(
        "*sFlow ASN Enricher* `v{}`\n*Host:* `{}`\n*Event:* `{}`\n{}\n\n*Time:* `{}`",
        env!("CARGO_PKG_VERSION"),
        host,
        kind,
        message,
        chrono::Local::now().format("%d/%m/%Y %H:%M:%S"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_suppresses_within_window() {
        let mut cooldowns = HashMap::new();
        let start = Instant::now();
        let window = Duration::from_secs(300);

        assert!(check_cooldown(&mut cooldowns, "destination_down:a".into(), start, window).is_none());

        let remaining =
            check_cooldown(&mut cooldowns, "destination_down:a".into(), start + Duration::from_secs(100), window)
                .expect("second alert inside the window must be suppressed");
        assert_eq!(remaining, Duration::from_secs(200));

        // A different key is independent.
        assert!(check_cooldown(&mut cooldowns, "destination_down:b".into(), start, window).is_none());

        // After the window the same key fires again and re-arms.
        assert!(
            check_cooldown(&mut cooldowns, "destination_down:a".into(), start + window + Duration::from_secs(101), window)
                .is_none()
        );
    }

    #[test]
    fn alert_kinds_gate_on_config() {
        let telegram = TelegramConfig {
            enabled: true,
            alert_on: vec!["startup".to_string(), "destination_down".to_string()],
            ..Default::default()
        };
        assert!(alert_enabled(&telegram, "startup"));
        assert!(alert_enabled(&telegram, "destination_down"));
        assert!(!alert_enabled(&telegram, "shutdown"));

        let disabled = TelegramConfig {
            enabled: false,
            alert_on: vec!["startup".to_string()],
            ..Default::default()
        };
        assert!(!alert_enabled(&disabled, "startup"));
    }

    #[test]
    fn alert_body_carries_event_and_message() {
        let body = format_alert("high_drop_rate", "*Drop rate:* `7.5%`");
        assert!(body.contains("*Event:* `high_drop_rate`"));
        assert!(body.contains("*Drop rate:* `7.5%`"));
        assert!(body.contains(env!("CARGO_PKG_VERSION")));
    }
}
