//! systemd readiness and watchdog notifications.
//!
//! Everything here is best-effort: outside systemd (no NOTIFY_SOCKET) all
//! calls are no-ops, and send failures are only logged.

use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub(crate) fn notify(state: &str) {
    let Ok(socket_path) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };
    if socket_path.is_empty() {
        return;
    }
    let Ok(socket) = UnixDatagram::unbound() else {
        return;
    };
    if let Err(err) = socket.send_to(state.as_bytes(), &socket_path) {
        tracing::debug!("sd_notify {} failed: {}", state, err);
    }
}

pub(crate) fn ready() {
    notify("READY=1");
}

pub(crate) fn stopping() {
    notify("STOPPING=1");
}

/// Starts the watchdog heartbeat when WATCHDOG_USEC is set, pinging at half
/// the configured interval.
pub(crate) fn spawn_watchdog(shutdown: CancellationToken) {
    let Ok(raw) = std::env::var("WATCHDOG_USEC") else {
        return;
    };
    let Ok(usec) = raw.parse::<u64>() else {
        tracing::warn!("ignoring unparseable WATCHDOG_USEC {}", raw);
        return;
    };
    if usec == 0 {
        return;
    }

    let interval = Duration::from_micros(usec / 2);
    tracing::info!("systemd watchdog started, interval {:?}", interval);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => notify("WATCHDOG=1"),
            }
        }
    });
}
