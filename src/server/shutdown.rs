//! Coordinated shutdown across background tasks.
//!
//! A watch channel fans the shutdown signal out to every component; the
//! binaries trigger it from SIGTERM/SIGINT.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::error;

/// Sender half: trigger shutdown exactly once.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        // receivers may already be gone during teardown
        let _ = self.tx.send(true);
    }
}

/// Receiver half: await or poll the shutdown trigger.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is triggered.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // sender dropped, treat as shutdown
                return;
            }
        }
    }

    /// True once shutdown has been triggered (or the controller is gone).
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

/// Create a linked controller/signal pair.
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownController { tx }, ShutdownSignal { rx })
}

/// Wait for SIGTERM or SIGINT and report which one arrived.
pub async fn wait_for_signal() -> &'static str {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            // fall back to ctrl-c only
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = tokio::signal::ctrl_c() => "SIGINT",
    }
}
