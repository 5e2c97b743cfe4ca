//! Optional auto-stop on process termination signals
//!
//! Opt-in via `dispose_on_signal`: the consumer registers a watcher for the
//! host's termination signal and runs `stop` on receipt. This is a per-
//! consumer option, not a process-global hook.

use crate::common::lifecycle::StopHandle;
use tracing::{info, warn};

/// Spawn a task that stops the consumer when the process receives a
/// termination signal (SIGTERM on unix, plus ctrl-c everywhere).
pub fn spawn_signal_watcher(handle: StopHandle) {
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received, stopping consumer");
        if let Err(e) = handle.stop().await {
            warn!("stop on signal failed: {e}");
        }
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to register SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
