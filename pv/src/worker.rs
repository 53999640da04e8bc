//! Worker process
//!
//! Serves the task channel: attaches the dispatcher's shared segment, opens
//! its endpoint pair, answers `ping` with `pong` until told to `STOP`, and
//! answers health probes on its own socket the whole time. The serve loop
//! never blocks unboundedly, so a shutdown request is honored within one
//! poll cycle.

use std::path::Path;
use std::time::Duration;

use eyre::{Context, Result};
use tracing::{debug, info, warn};

use crate::channel::messages::TASK_PONG;
use crate::channel::{ChannelError, ChannelReader, ChannelWriter, ControlMessage, conduit_paths};
use crate::config::Config;
use crate::health::HealthListener;
use crate::probe::spawn_liveness_responder;
use crate::process::{Role, register_self};
use crate::segment::SharedSegment;
use crate::shutdown;

/// How long to wait for the dispatcher to create the conduits
const CONDUIT_ATTEMPTS: u32 = 10;
const CONDUIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    ReadyListening,
    Serving,
    Stopping,
    Terminated,
}

/// The worker process
pub struct Worker {
    config: Config,
    state: WorkerState,
}

impl Worker {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: WorkerState::Initializing,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(from = ?self.state, to = ?next, "Worker: state transition");
        self.state = next;
    }

    /// Run the worker to completion
    pub async fn run(mut self) -> Result<()> {
        let dir = self.config.runtime_dir();
        let pid_file = register_self(&dir, Role::Worker)?;

        let result = self.serve(&dir).await;

        // Removed exactly once, on every exit path
        pid_file.remove()?;
        self.transition(WorkerState::Terminated);
        info!("Worker terminated");
        result
    }

    async fn serve(&mut self, dir: &Path) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let signal_task = shutdown::spawn_signal_listener(shutdown_tx.clone())?;
        let responder = spawn_liveness_responder(dir)?;

        let result = self.serve_inner(dir, shutdown_rx).await;

        responder.abort();
        signal_task.abort();
        result
    }

    async fn serve_inner(&mut self, dir: &Path, shutdown_rx: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        // Cannot proceed without the handoff data
        let mut segment = SharedSegment::attach(&self.config.segment.name)
            .context("Shared segment unavailable; was the dispatcher started first?")?;
        segment.verify_marker().context("Shared segment has no valid handoff marker")?;
        let contents = segment.read(self.config.segment.size)?;
        info!(name = %segment.name(), ?contents, "Attached handoff segment");

        let health = HealthListener::spawn(
            &self.config.listen.health_addr(Role::Worker),
            Role::Worker,
            shutdown_rx.clone(),
        )
        .await?;

        let open_result = self.open_endpoints(dir, shutdown_rx.clone()).await;
        let result = match open_result {
            Ok((reader, writer)) => {
                self.transition(WorkerState::ReadyListening);
                info!("Worker ready");
                self.serve_loop(reader, writer, shutdown_rx.clone()).await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.transition(WorkerState::Stopping);
        if let Err(e) = segment.detach() {
            warn!(error = %e, "Segment detach failed");
        }
        health.stop().await;
        result
    }

    /// Open the endpoint pair, waiting for the dispatcher to create the
    /// conduits first. Inbound before outbound, mirroring the dispatcher's
    /// outbound-before-inbound, so neither side deadlocks on the FIFO
    /// open handshake.
    async fn open_endpoints(
        &mut self,
        dir: &Path,
        shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(ChannelReader, ChannelWriter)> {
        let pair = conduit_paths(dir);

        let mut attempt = 0;
        while !(pair.task_in.exists() && pair.task_out.exists()) {
            attempt += 1;
            if attempt >= CONDUIT_ATTEMPTS {
                return Err(eyre::eyre!("conduits never appeared under {}", dir.display()));
            }
            if *shutdown_rx.borrow() {
                return Err(eyre::eyre!("shutdown requested while waiting for conduits"));
            }
            debug!(attempt, "Worker: waiting for conduits");
            tokio::time::sleep(CONDUIT_RETRY_DELAY).await;
        }

        let open_timeout = self.config.channel.open_timeout();
        let reader = ChannelReader::open(&pair.task_in, open_timeout)
            .await
            .context("Failed to open task channel (inbound)")?;
        let writer = ChannelWriter::open(&pair.task_out, open_timeout)
            .await
            .context("Failed to open task channel (outbound)")?;
        Ok((reader, writer))
    }

    async fn serve_loop(
        &mut self,
        mut reader: ChannelReader,
        mut writer: ChannelWriter,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) {
        self.transition(WorkerState::Serving);
        let poll = self.config.channel.poll_interval();

        loop {
            if *shutdown_rx.borrow() {
                info!("Shutdown requested");
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown requested");
                    break;
                }
                received = reader.recv(poll) => match received {
                    Ok(line) => match ControlMessage::parse(&line) {
                        ControlMessage::Ping => {
                            debug!("Worker: ping");
                            match writer.send(TASK_PONG).await {
                                Ok(()) => {}
                                Err(ChannelError::Broken) => {
                                    warn!("Dispatcher disconnected mid-reply");
                                    break;
                                }
                                Err(e) => {
                                    warn!(error = %e, "Task reply failed");
                                    break;
                                }
                            }
                        }
                        ControlMessage::Stop => {
                            info!("Stop requested on task channel");
                            break;
                        }
                        ControlMessage::Other(line) => {
                            debug!(%line, "Ignoring unrecognized task line");
                        }
                    },
                    Err(ChannelError::Timeout) => continue,
                    Err(ChannelError::Closed) => {
                        warn!("Task channel closed; dispatcher probably stopped");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Task channel receive failed");
                        break;
                    }
                }
            }
        }
    }
}
