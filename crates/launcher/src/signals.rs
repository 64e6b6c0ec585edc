//! Turn termination signals into lifecycle events.

use log::{info, warn};
use tokio::task::JoinHandle;

use crate::lifecycle::{LifecycleEvent, LifecycleHandle};

/// Forward SIGTERM / SIGINT (Ctrl-C on Windows) to the orchestrator.
///
/// Every signal is forwarded; the orchestrator ignores the ones that
/// arrive after shutdown started. The task ends when the orchestrator is gone.
pub fn forward_signals(handle: LifecycleHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(name) = next_signal().await else {
                return;
            };
            info!("[signals] Received {}", name);
            if !handle.send(LifecycleEvent::Signal(name)) {
                return;
            }
        }
    })
}

#[cfg(unix)]
async fn next_signal() -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("[signals] Failed to install signal handlers: {}", e);
            return None;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => Some("SIGTERM"),
        _ = sigint.recv() => Some("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> Option<&'static str> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some("ctrl-c"),
        Err(e) => {
            warn!("[signals] Failed to listen for Ctrl-C: {}", e);
            None
        }
    }
}
