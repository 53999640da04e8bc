//! Watchdog process
//!
//! External supervisor for the dispatcher/worker pair. It spawns the
//! dispatcher, learns the worker's pid from the record the dispatcher
//! publishes, probes both on every supervision cycle through the configured
//! liveness strategy, and restarts the pipeline when a process is
//! unreachable or misses too many probes in a row. Supervision state lives
//! in explicit per-process records owned by this loop, not in shared flags.

use std::path::{Path, PathBuf};

use eyre::Result;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ProbeStrategyKind};
use crate::probe::{LivenessOutcome, LivenessStrategy, LivenessVerdict, SignalProbe, SocketProbe};
use crate::process::{PidFile, ProcessRecord, Role, is_process_running, register_self, spawn_and_register, terminate_process};
use crate::shutdown;

/// One supervised process with its consecutive-miss counter
pub struct SupervisedProcess {
    pub record: ProcessRecord,
    misses: u32,
}

impl SupervisedProcess {
    fn new(record: ProcessRecord) -> Self {
        Self { record, misses: 0 }
    }
}

/// What the restart policy decided for one verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Keep,
    Restart,
}

/// The watchdog process
pub struct Watchdog {
    config: Config,
    config_path: Option<PathBuf>,
    strategy: Box<dyn LivenessStrategy>,
}

impl Watchdog {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let strategy: Box<dyn LivenessStrategy> = match config.supervision.strategy {
            ProbeStrategyKind::Socket => Box::new(SocketProbe::new(
                config.listen.clone(),
                config.supervision.probe_timeout(),
            )),
            ProbeStrategyKind::Signal => Box::new(SignalProbe::new(config.supervision.probe_timeout())?),
        };
        info!(strategy = strategy.name(), "Watchdog using liveness strategy");
        Ok(Self {
            config,
            config_path,
            strategy,
        })
    }

    /// Run the watchdog to completion
    pub async fn run(mut self) -> Result<()> {
        let dir = self.config.runtime_dir();
        // The signal strategy's confirmations are addressed to this record
        let pid_file = register_self(&dir, Role::Watchdog)?;

        let result = self.supervise(&dir).await;

        pid_file.remove()?;
        info!("Watchdog stopped");
        result
    }

    async fn supervise(&mut self, dir: &Path) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = shutdown::channel();
        let signal_task = shutdown::spawn_signal_listener(shutdown_tx.clone())?;

        info!("Watchdog started");
        let mut dispatcher = SupervisedProcess::new(spawn_and_register(
            Role::Dispatcher,
            dir,
            self.config_path.as_deref(),
        )?);
        let mut worker = self.discover_worker(dir).await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(self.config.supervision.interval()) => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }

            // The worker record may have been missing at the last attempt
            if worker.is_none() {
                worker = self.discover_worker(dir).await;
            }

            let verdict = self.strategy.probe(&dispatcher.record).await;
            if self.apply(&mut dispatcher, &verdict) == Action::Restart {
                self.restart_pipeline(dir, &mut dispatcher, &mut worker).await;
                continue;
            }

            let worker_action = match worker.as_mut() {
                Some(w) => {
                    let verdict = self.strategy.probe(&w.record).await;
                    self.apply(w, &verdict)
                }
                None => Action::Keep,
            };
            if worker_action == Action::Restart {
                self.restart_pipeline(dir, &mut dispatcher, &mut worker).await;
            }
        }

        self.teardown(dir, &mut dispatcher, worker.as_mut()).await;
        signal_task.abort();
        Ok(())
    }

    /// Restart policy: unreachable restarts immediately, unresponsive after
    /// `max-misses` consecutive misses
    fn apply(&self, process: &mut SupervisedProcess, verdict: &LivenessVerdict) -> Action {
        match verdict.outcome {
            LivenessOutcome::Alive => {
                process.misses = 0;
                process.record.mark_alive();
                debug!(role = %process.record.role, "Probe: alive");
                Action::Keep
            }
            LivenessOutcome::Unreachable => {
                process.record.mark_unresponsive();
                warn!(role = %process.record.role, pid = process.record.pid, "Probe: unreachable");
                Action::Restart
            }
            LivenessOutcome::Timeout => {
                process.misses += 1;
                process.record.mark_unresponsive();
                warn!(
                    role = %process.record.role,
                    pid = process.record.pid,
                    misses = process.misses,
                    "Probe: no reply before timeout"
                );
                if process.misses >= self.config.supervision.max_misses {
                    Action::Restart
                } else {
                    Action::Keep
                }
            }
        }
    }

    /// Tear down the pair and spawn a fresh dispatcher
    ///
    /// The dispatcher is always the spawn target; it re-spawns its own
    /// worker. Terminating both first also frees the worker's health port
    /// for the successor.
    async fn restart_pipeline(
        &mut self,
        dir: &Path,
        dispatcher: &mut SupervisedProcess,
        worker: &mut Option<SupervisedProcess>,
    ) {
        let grace = self.config.supervision.grace_period();
        dispatcher.record.mark_restarting();
        warn!(pid = dispatcher.record.pid, "Restarting pipeline");

        terminate_process(dispatcher.record.pid, grace).await;
        if let Some(w) = worker.take() {
            if is_process_running(w.record.pid) {
                terminate_process(w.record.pid, grace).await;
            }
        }
        // Force-killed processes cannot remove their own records
        let _ = PidFile::for_role(dir, Role::Dispatcher).remove();
        let _ = PidFile::for_role(dir, Role::Worker).remove();

        match spawn_and_register(Role::Dispatcher, dir, self.config_path.as_deref()) {
            Ok(record) => {
                *dispatcher = SupervisedProcess::new(record);
                *worker = self.discover_worker(dir).await;
            }
            Err(e) => {
                // Keep the dead record; the next cycle's unreachable verdict
                // retries the restart.
                error!(error = %e, "Dispatcher respawn failed");
            }
        }
    }

    /// Learn the worker's pid from the record the dispatcher publishes
    ///
    /// Bounded polling; exhausting the retries is fatal for this attempt
    /// and retried on the next supervision cycle.
    async fn discover_worker(&self, dir: &Path) -> Option<SupervisedProcess> {
        let pid_file = PidFile::for_role(dir, Role::Worker);
        for attempt in 0..self.config.supervision.pid_retries {
            if let Some(pid) = pid_file.read() {
                if is_process_running(pid) {
                    info!(pid, "Discovered worker");
                    return Some(SupervisedProcess::new(ProcessRecord::new(Role::Worker, pid)));
                }
            }
            debug!(attempt, "discover_worker: record not there yet");
            tokio::time::sleep(self.config.supervision.pid_retry_delay()).await;
        }
        error!("Worker pid record never appeared; will retry next cycle");
        None
    }

    /// Graceful shutdown: stop the dispatcher (whose drain stops the worker)
    async fn teardown(&mut self, dir: &Path, dispatcher: &mut SupervisedProcess, worker: Option<&mut SupervisedProcess>) {
        info!("Shutting down pipeline");
        let grace = self.config.supervision.grace_period();

        terminate_process(dispatcher.record.pid, grace).await;
        dispatcher.record.mark_stopped();

        if let Some(w) = worker {
            if is_process_running(w.record.pid) {
                // The dispatcher's drain did not get to it
                terminate_process(w.record.pid, grace).await;
                let _ = PidFile::for_role(dir, Role::Worker).remove();
            }
            w.record.mark_stopped();
        }
        let _ = PidFile::for_role(dir, Role::Dispatcher).remove();
    }
}
