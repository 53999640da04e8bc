//! Pipevisor - supervised dispatcher/worker pipeline
//!
//! Pipevisor runs three cooperating processes on one host: a dispatcher
//! relaying client commands, a worker serving them, and a watchdog that
//! probes both and restarts whatever hangs or dies. They coordinate through
//! a named shared-memory segment, a pair of named FIFOs with line framing,
//! and TCP health-check sockets.
//!
//! # Core Concepts
//!
//! - **Explicit liveness**: every process answers probes; the watchdog owns
//!   the restart decision
//! - **Bounded waits everywhere**: no cross-process read without a timeout,
//!   so shutdown is honored within one poll cycle
//! - **Resources have one owner**: the dispatcher creates and removes the
//!   conduits and the segment; attachers never unlink
//! - **Discovery through records**: each process publishes its pid to a
//!   well-known location and removes it on graceful exit
//!
//! # Modules
//!
//! - [`channel`] - FIFO conduits, line framing, and the control vocabulary
//! - [`segment`] - shared-memory segment lifecycle
//! - [`probe`] - liveness strategies (socket and signal)
//! - [`process`] - pid records, spawning, and termination
//! - [`worker`] / [`dispatcher`] / [`watchdog`] - the three processes
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod channel;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod health;
pub mod probe;
pub mod process;
pub mod segment;
pub mod shutdown;
pub mod watchdog;
pub mod worker;

// Re-export commonly used types
pub use channel::{ChannelError, ChannelReader, ChannelWriter, ControlMessage, conduit_paths, create_conduits, remove_conduits};
pub use config::{ChannelConfig, Config, ListenConfig, ProbeStrategyKind, SegmentConfig, SupervisionConfig};
pub use dispatcher::{Dispatcher, DispatcherState};
pub use health::HealthListener;
pub use probe::{LivenessOutcome, LivenessStrategy, LivenessVerdict, SignalProbe, SocketProbe};
pub use process::{PidFile, ProcessRecord, ProcessState, Role, is_process_running, register_self, spawn_and_register, terminate_process};
pub use segment::{INIT_MARKER, SegmentError, SharedSegment};
pub use watchdog::Watchdog;
pub use worker::{Worker, WorkerState};
