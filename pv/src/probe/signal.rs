//! Signal-based liveness probing
//!
//! The watchdog sends SIGUSR1 to the target; the target's responder task
//! sends SIGUSR2 back to the watchdog's pid, read from the watchdog's
//! published pid record (only the watchdog listens for confirmations, so
//! replying to the parent pid would reach the wrong process when the
//! dispatcher is the spawner). A plain signal carries no sender identity, so
//! the watchdog probes one target at a time and drains stale confirmations
//! before each send.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::process::{PidFile, ProcessRecord, Role};

use super::{LivenessOutcome, LivenessStrategy, LivenessVerdict};

/// SIGUSR1/SIGUSR2 probe (watchdog side)
pub struct SignalProbe {
    timeout: Duration,
    confirmations: tokio::signal::unix::Signal,
}

impl SignalProbe {
    /// Register the SIGUSR2 confirmation stream
    pub fn new(timeout: Duration) -> Result<Self> {
        let confirmations = signal(SignalKind::user_defined2()).context("Failed to register SIGUSR2 stream")?;
        Ok(Self { timeout, confirmations })
    }

    /// Throw away confirmations from earlier probes
    async fn drain(&mut self) {
        while tokio::time::timeout(Duration::from_millis(1), self.confirmations.recv())
            .await
            .is_ok()
        {}
    }
}

#[async_trait]
impl LivenessStrategy for SignalProbe {
    async fn probe(&mut self, record: &ProcessRecord) -> LivenessVerdict {
        self.drain().await;

        debug!(role = %record.role, pid = record.pid, "SignalProbe: sending liveness request");
        if kill(Pid::from_raw(record.pid as i32), Signal::SIGUSR1).is_err() {
            // ESRCH: the pid is gone
            return LivenessVerdict::new(record.role, LivenessOutcome::Unreachable);
        }

        let outcome = match tokio::time::timeout(self.timeout, self.confirmations.recv()).await {
            Ok(Some(())) => LivenessOutcome::Alive,
            _ => LivenessOutcome::Timeout,
        };
        debug!(role = %record.role, pid = record.pid, ?outcome, "SignalProbe: verdict");
        LivenessVerdict::new(record.role, outcome)
    }

    fn name(&self) -> &'static str {
        "signal"
    }
}

/// Target-side responder: answer each SIGUSR1 with SIGUSR2 to the watchdog
///
/// Dispatcher and worker spawn this at startup. The watchdog's pid is read
/// per request so a restarted watchdog is picked up without re-registration.
pub fn spawn_liveness_responder(runtime_dir: &Path) -> Result<JoinHandle<()>> {
    let mut requests = signal(SignalKind::user_defined1()).context("Failed to register SIGUSR1 stream")?;
    let dir: PathBuf = runtime_dir.to_path_buf();

    let handle = tokio::spawn(async move {
        while requests.recv().await.is_some() {
            match PidFile::for_role(&dir, Role::Watchdog).read() {
                Some(watchdog_pid) => {
                    debug!(watchdog_pid, "liveness_responder: confirming");
                    if let Err(e) = kill(Pid::from_raw(watchdog_pid as i32), Signal::SIGUSR2) {
                        warn!(watchdog_pid, error = %e, "Liveness confirmation failed");
                    }
                }
                None => {
                    warn!("Liveness request received but no watchdog pid record found");
                }
            }
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::register_self;
    use serial_test::serial;
    use tempfile::TempDir;

    // Signal streams are process-global; keep these tests serialized.

    #[tokio::test]
    #[serial]
    async fn test_responding_process_is_alive() {
        let temp_dir = TempDir::new().unwrap();
        // This test process plays both watchdog and target
        register_self(temp_dir.path(), Role::Watchdog).unwrap();
        let responder = spawn_liveness_responder(temp_dir.path()).unwrap();

        let mut probe = SignalProbe::new(Duration::from_secs(2)).unwrap();
        let record = ProcessRecord::new(Role::Worker, std::process::id());
        let verdict = probe.probe(&record).await;

        assert_eq!(verdict.outcome, LivenessOutcome::Alive);
        responder.abort();
    }

    #[tokio::test]
    #[serial]
    async fn test_dead_pid_is_unreachable() {
        let mut probe = SignalProbe::new(Duration::from_millis(200)).unwrap();
        let record = ProcessRecord::new(Role::Worker, u32::MAX / 2);
        let verdict = probe.probe(&record).await;

        assert_eq!(verdict.outcome, LivenessOutcome::Unreachable);
    }

    #[tokio::test]
    #[serial]
    async fn test_silent_process_times_out() {
        // No responder task installed, so SIGUSR1 is delivered to our own
        // (tokio-registered, but unanswered) handler and no confirmation
        // ever arrives.
        let mut requests = signal(SignalKind::user_defined1()).unwrap();

        let mut probe = SignalProbe::new(Duration::from_millis(200)).unwrap();
        let record = ProcessRecord::new(Role::Worker, std::process::id());
        let verdict = probe.probe(&record).await;

        assert_eq!(verdict.outcome, LivenessOutcome::Timeout);
        // The request did arrive; it just went unanswered
        assert!(
            tokio::time::timeout(Duration::from_millis(100), requests.recv())
                .await
                .is_ok()
        );
    }
}
