//! Process lifecycle management
//!
//! Handles pid record publication, process spawning, and termination with
//! SIGTERM -> SIGKILL escalation. Both the watchdog and the dispatcher spawn
//! their children through [`spawn_and_register`], so every supervised process
//! is discoverable through its published pid record.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Role of a process in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Watchdog,
    Dispatcher,
    Worker,
}

impl Role {
    /// Short name used in pid record filenames and log messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Watchdog => "watchdog",
            Role::Dispatcher => "dispatcher",
            Role::Worker => "worker",
        }
    }

    /// Internal subcommand that runs this role (see cli.rs)
    pub fn subcommand(&self) -> &'static str {
        match self {
            Role::Watchdog => "watchdog",
            Role::Dispatcher => "run-dispatcher",
            Role::Worker => "run-worker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervision state of a process record
///
/// Transitions only `Starting -> Running -> {Unresponsive -> Restarting} ->
/// Running`, or `Running -> Stopped` on graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Running,
    Unresponsive,
    Restarting,
    Stopped,
}

/// A supervised process as the watchdog sees it
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub role: Role,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: ProcessState,
}

impl ProcessRecord {
    pub fn new(role: Role, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            role,
            pid,
            started_at: now,
            last_seen: now,
            state: ProcessState::Starting,
        }
    }

    /// Record a successful probe
    pub fn mark_alive(&mut self) {
        self.last_seen = Utc::now();
        self.state = ProcessState::Running;
    }

    pub fn mark_unresponsive(&mut self) {
        self.state = ProcessState::Unresponsive;
    }

    pub fn mark_restarting(&mut self) {
        self.state = ProcessState::Restarting;
    }

    pub fn mark_stopped(&mut self) {
        self.state = ProcessState::Stopped;
    }
}

/// Published pid record for one role
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Pid record for `role` under `dir`
    pub fn for_role(dir: &Path, role: Role) -> Self {
        Self {
            path: dir.join(format!("{}.pid", role.as_str())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the pid from the record
    pub fn read(&self) -> Option<u32> {
        debug!(?self.path, "PidFile::read: called");
        if !self.path.exists() {
            debug!("PidFile::read: pid record does not exist");
            return None;
        }

        let mut file = fs::File::open(&self.path).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;

        let pid = contents.trim().parse().ok();
        debug!(?pid, "PidFile::read: returning");
        pid
    }

    /// Write `pid` to the record, creating parent directories as needed
    pub fn write(&self, pid: u32) -> Result<()> {
        debug!(pid, ?self.path, "PidFile::write: called");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create pid record directory")?;
        }

        let mut file = fs::File::create(&self.path).context("Failed to create pid record")?;
        write!(file, "{}", pid).context("Failed to write pid")?;

        debug!(pid, path = ?self.path, "Wrote pid record");
        Ok(())
    }

    /// Remove the record; missing is not an error
    pub fn remove(&self) -> Result<()> {
        debug!(?self.path, "PidFile::remove: called");
        if self.path.exists() {
            fs::remove_file(&self.path).context("Failed to remove pid record")?;
            debug!(path = ?self.path, "Removed pid record");
        } else {
            debug!("PidFile::remove: record does not exist");
        }
        Ok(())
    }

    /// Pid from the record, filtered to live processes
    pub fn running_pid(&self) -> Option<u32> {
        self.read().filter(|&pid| is_process_running(pid))
    }
}

/// Publish the calling process's own pid record
pub fn register_self(dir: &Path, role: Role) -> Result<PidFile> {
    debug!(%role, "register_self: called");
    let pid_file = PidFile::for_role(dir, role);
    pid_file.write(std::process::id())?;
    info!(pid = std::process::id(), %role, "Registered pid record");
    Ok(pid_file)
}

/// Spawn the process for `role` and publish its pid record
///
/// The child is the current executable re-invoked with the role's internal
/// subcommand, detached from our stdio. Returns the record the watchdog (or
/// dispatcher) tracks from then on.
pub fn spawn_and_register(role: Role, dir: &Path, config_path: Option<&Path>) -> Result<ProcessRecord> {
    debug!(%role, "spawn_and_register: called");

    let exe = std::env::current_exe().context("Failed to get current executable")?;
    debug!(?exe, %role, "spawn_and_register: spawning process");

    let mut cmd = Command::new(&exe);
    cmd.arg(role.subcommand())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }

    let child = cmd.spawn().context(format!("Failed to spawn {} process", role))?;

    let pid = child.id();
    PidFile::for_role(dir, role).write(pid)?;

    info!(pid, %role, "Spawned process");
    Ok(ProcessRecord::new(role, pid))
}

/// Check if a process with the given pid is running
pub fn is_process_running(pid: u32) -> bool {
    debug!(pid, "is_process_running: called");
    // Reap first so an exited child of ours does not linger as a zombie and
    // keep answering signal 0.
    try_reap(pid);

    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Sending signal 0 checks if the process exists without affecting it
    let result = kill(Pid::from_raw(pid as i32), None).is_ok();
    debug!(pid, result, "is_process_running: returning");
    result
}

/// Collect the exit status of `pid` if it is a zombie child of ours
fn try_reap(pid: u32) {
    use nix::sys::wait::{WaitPidFlag, waitpid};
    use nix::unistd::Pid;
    // ECHILD when the pid is not our child; that is fine
    let _ = waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG));
}

/// Send SIGTERM to `pid`
pub fn send_sigterm(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    debug!(pid, "send_sigterm: called");
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;
    Ok(())
}

/// Terminate a process: SIGTERM, bounded wait, then SIGKILL
///
/// Returns true if the process exited within the grace period (i.e. without
/// needing SIGKILL).
pub async fn terminate_process(pid: u32, grace: Duration) -> bool {
    debug!(pid, ?grace, "terminate_process: called");

    if !is_process_running(pid) {
        debug!(pid, "terminate_process: already gone");
        return true;
    }

    if let Err(e) = send_sigterm(pid) {
        debug!(pid, error = %e, "terminate_process: SIGTERM failed");
    }

    let poll = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while is_process_running(pid) && waited < grace {
        tokio::time::sleep(poll).await;
        waited += poll;
    }

    if is_process_running(pid) {
        warn!(pid, "Process did not stop gracefully, sending SIGKILL");
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        // Give the kernel a moment, then reap
        tokio::time::sleep(poll).await;
        try_reap(pid);
        return false;
    }

    debug!(pid, "terminate_process: exited gracefully");
    true
}
