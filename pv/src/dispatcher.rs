//! Dispatcher process
//!
//! Owns the pipeline's shared resources: it creates the conduit pair and the
//! shared segment, spawns the worker, and relays client commands to it over
//! the task channel with strict one-to-one request/reply ordering. On drain
//! it stops the worker and removes every OS resource it created.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::messages::{ERROR_PREFIX, FAREWELL, QUIT_SENTINEL, STOP_COMMAND};
use crate::channel::{ChannelError, ChannelReader, ChannelWriter, create_conduits, remove_conduits};
use crate::config::Config;
use crate::health::{HealthListener, bind_listener};
use crate::probe::spawn_liveness_responder;
use crate::process::{PidFile, Role, is_process_running, register_self, spawn_and_register, terminate_process};
use crate::segment::SharedSegment;
use crate::shutdown;

/// Dispatcher lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Initializing,
    AwaitingClient,
    Relaying,
    Draining,
    Terminated,
}

/// How one client session ended
enum SessionEnd {
    /// Client went away; accept the next one
    Disconnected,
    /// Client sent the quit sentinel; drain the pipeline
    Quit,
}

/// The dispatcher process
pub struct Dispatcher {
    config: Config,
    config_path: Option<PathBuf>,
    state: DispatcherState,
}

impl Dispatcher {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
            state: DispatcherState::Initializing,
        }
    }

    fn transition(&mut self, next: DispatcherState) {
        debug!(from = ?self.state, to = ?next, "Dispatcher: state transition");
        self.state = next;
    }

    /// Run the dispatcher to completion
    pub async fn run(mut self) -> Result<()> {
        let dir = self.config.runtime_dir();
        let pid_file = register_self(&dir, Role::Dispatcher)?;

        let result = self.pipeline(&dir).await;

        pid_file.remove()?;
        self.transition(DispatcherState::Terminated);
        info!("Dispatcher terminated");
        result
    }

    async fn pipeline(&mut self, dir: &Path) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let signal_task = shutdown::spawn_signal_listener(shutdown_tx.clone())?;
        let responder = spawn_liveness_responder(dir)?;

        let result = self.pipeline_inner(dir, shutdown_rx).await;

        responder.abort();
        signal_task.abort();
        result
    }

    async fn pipeline_inner(&mut self, dir: &Path, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        create_conduits(dir)?;
        // If we die before the explicit destroy, dropping the owner handle
        // unlinks the OS object; the next instance's stale recovery covers a
        // hard kill.
        let mut segment = SharedSegment::create(&self.config.segment.name, self.config.segment.size)
            .context("Failed to create shared segment")?;

        let worker_record = spawn_and_register(Role::Worker, dir, self.config_path.as_deref())?;

        let health = HealthListener::spawn(
            &self.config.listen.health_addr(Role::Dispatcher),
            Role::Dispatcher,
            shutdown_rx.clone(),
        )
        .await?;
        let client_listener = bind_listener(&self.config.listen.client_addr()).await?;
        info!(addr = %self.config.listen.client_addr(), "Client listener ready");

        // Outbound before inbound, pairing with the worker's inbound-first
        // open order; each open blocks until the worker arrives.
        let open_timeout = self.config.channel.open_timeout();
        let paths = crate::channel::conduit_paths(dir);
        let mut task_tx = ChannelWriter::open(&paths.task_in, open_timeout)
            .await
            .context("Worker never opened the task channel")?;
        let mut task_rx = ChannelReader::open(&paths.task_out, open_timeout)
            .await
            .context("Worker never opened the reply channel")?;
        info!("Task channel established");

        self.accept_loop(&client_listener, &mut task_tx, &mut task_rx, shutdown_rx.clone())
            .await;

        self.drain(dir, &mut segment, task_tx, task_rx, worker_record.pid).await;
        drop(client_listener);
        health.stop().await;
        Ok(())
    }

    /// Accept one client at a time until quit or shutdown
    async fn accept_loop(
        &mut self,
        listener: &TcpListener,
        task_tx: &mut ChannelWriter,
        task_rx: &mut ChannelReader,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown_rx.borrow() {
                info!("Shutdown requested");
                return;
            }
            self.transition(DispatcherState::AwaitingClient);
            info!("Awaiting client connection");

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown requested");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "Client connected");
                        match self.relay_session(stream, task_tx, task_rx, &mut shutdown_rx).await {
                            SessionEnd::Disconnected => continue,
                            SessionEnd::Quit => return,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Client accept failed");
                        continue;
                    }
                }
            }
        }
    }

    /// Relay one client session line by line
    async fn relay_session(
        &mut self,
        stream: TcpStream,
        task_tx: &mut ChannelWriter,
        task_rx: &mut ChannelReader,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        self.transition(DispatcherState::Relaying);
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    return SessionEnd::Disconnected;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line == QUIT_SENTINEL {
                            let farewell = format!("{}\n", FAREWELL);
                            let _ = write_half.write_all(farewell.as_bytes()).await;
                            info!("Client quit; draining pipeline");
                            return SessionEnd::Quit;
                        }

                        let reply = self.relay_line(&line, task_tx, task_rx).await;
                        let framed = format!("{}\n", reply);
                        if write_half.write_all(framed.as_bytes()).await.is_err() {
                            info!("Client went away mid-reply");
                            return SessionEnd::Disconnected;
                        }
                    }
                    Ok(None) => {
                        info!("Client disconnected");
                        return SessionEnd::Disconnected;
                    }
                    Err(e) => {
                        warn!(error = %e, "Client read failed");
                        return SessionEnd::Disconnected;
                    }
                }
            }
        }
    }

    /// Forward one line to the worker and await its reply
    ///
    /// Strictly one exchange in flight: the next line is not sent until this
    /// one got a reply or timed out. The client always gets a line back.
    async fn relay_line(&mut self, line: &str, task_tx: &mut ChannelWriter, task_rx: &mut ChannelReader) -> String {
        // A reply that arrived after an earlier timeout would otherwise be
        // matched to this request; throw stale lines away first.
        while task_rx.recv(Duration::from_millis(1)).await.is_ok() {
            debug!("Dispatcher: discarded stale worker reply");
        }

        debug!(%line, "Dispatcher: forwarding task line");
        if let Err(e) = task_tx.send(line).await {
            warn!(error = %e, "Task forward failed");
            return format!("{} worker unavailable", ERROR_PREFIX);
        }

        match task_rx.recv(self.config.channel.reply_timeout()).await {
            Ok(reply) => reply,
            Err(ChannelError::Timeout) => {
                warn!(%line, "No worker reply before timeout");
                format!("{} no reply from worker", ERROR_PREFIX)
            }
            Err(e) => {
                warn!(error = %e, "Worker reply channel failed");
                format!("{} worker unavailable", ERROR_PREFIX)
            }
        }
    }

    /// Stop the worker and remove every resource this process created
    async fn drain(
        &mut self,
        dir: &Path,
        segment: &mut SharedSegment,
        mut task_tx: ChannelWriter,
        task_rx: ChannelReader,
        worker_pid: u32,
    ) {
        self.transition(DispatcherState::Draining);
        info!("Draining pipeline");

        if is_process_running(worker_pid) {
            if let Err(e) = task_tx.send(STOP_COMMAND).await {
                debug!(error = %e, "Stop command not delivered");
            }

            // Give the worker its grace period to exit on its own
            let grace = self.config.supervision.grace_period();
            let poll = Duration::from_millis(100);
            let mut waited = Duration::ZERO;
            while is_process_running(worker_pid) && waited < grace {
                tokio::time::sleep(poll).await;
                waited += poll;
            }

            if is_process_running(worker_pid) {
                warn!(pid = worker_pid, "Worker ignored stop command; forcing termination");
                terminate_process(worker_pid, grace).await;
            }
        }
        // A force-killed or crashed worker cannot remove its own record
        let _ = PidFile::for_role(dir, Role::Worker).remove();

        drop(task_tx);
        drop(task_rx);
        if let Err(e) = remove_conduits(dir) {
            warn!(error = %e, "Conduit removal failed");
        }
        if let Err(e) = segment.destroy() {
            warn!(error = %e, "Segment destroy failed");
        }
    }
}
