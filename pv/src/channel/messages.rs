//! Control vocabulary for the pipeline's line protocols
//!
//! Every message is a single line of text terminated by exactly one `\n`.
//! The vocabulary is closed; lines outside it are logged and ignored by
//! receivers so newer peers can extend the protocol without breaking old
//! ones.

use crate::process::Role;

/// Task request the dispatcher relays to the worker
pub const TASK_PING: &str = "ping";

/// Task reply the worker sends for [`TASK_PING`]
pub const TASK_PONG: &str = "pong";

/// Stop command: the receiver exits its processing loop, no reply
pub const STOP_COMMAND: &str = "STOP";

/// Client sentinel closing the session (and draining the pipeline)
pub const QUIT_SENTINEL: &str = "QUIT";

/// Farewell reply sent to the client for [`QUIT_SENTINEL`]
pub const FAREWELL: &str = "BYE";

/// Probe token the watchdog sends on a health-check connection
pub const HEALTH_PROBE: &str = "watchdog-health-test";

/// Prefix of synthesized error lines on the client path
pub const ERROR_PREFIX: &str = "ERROR:";

/// Health-check reply identifying the probed process
pub fn health_reply(role: Role) -> &'static str {
    match role {
        Role::Dispatcher => "dispatcher-alive",
        Role::Worker => "worker-alive",
        Role::Watchdog => "watchdog-alive",
    }
}

/// A parsed line from the task channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Task request, answered with [`TASK_PONG`]
    Ping,
    /// Terminate the processing loop
    Stop,
    /// Outside the vocabulary; logged and ignored
    Other(String),
}

impl ControlMessage {
    /// Classify one received line
    pub fn parse(line: &str) -> Self {
        match line {
            TASK_PING => ControlMessage::Ping,
            STOP_COMMAND => ControlMessage::Stop,
            other => ControlMessage::Other(other.to_string()),
        }
    }
}
