//! Shutdown token
//!
//! An explicit cancellation token checked at every bounded-wait boundary,
//! set by a dedicated signal-listener task. Signal handlers never mutate
//! process state directly; they only flip the token, and the owning loop
//! performs the orderly transition to its Draining/Stopping state.

use eyre::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Create a shutdown token pair
///
/// The sender side belongs to whoever decides to shut down (the signal
/// listener, or the loop itself); receivers are checked inside bounded
/// waits.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Flip the token; receivers observe it within one poll cycle
pub fn request(tx: &watch::Sender<bool>) {
    let _ = tx.send(true);
}

/// Listen for SIGINT/SIGTERM and flip the token on the first one
pub fn spawn_signal_listener(tx: watch::Sender<bool>) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT stream")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM stream")?;

    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                warn!("SIGINT received");
            }
            _ = sigterm.recv() => {
                warn!("SIGTERM received");
            }
        }
        debug!("signal_listener: requesting shutdown");
        let _ = tx.send(true);
    });
    Ok(handle)
}
