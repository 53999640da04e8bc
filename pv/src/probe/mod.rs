//! Liveness probing
//!
//! The watchdog classifies each supervised process as alive, unresponsive
//! (timeout), or unreachable through a [`LivenessStrategy`]. Two strategies
//! exist: a TCP health-check probe and a SIGUSR1/SIGUSR2 exchange; one is
//! selected per deployment in the supervision config.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::process::{ProcessRecord, Role};

pub mod signal;
pub mod socket;

pub use signal::{SignalProbe, spawn_liveness_responder};
pub use socket::SocketProbe;

/// Probe classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessOutcome {
    /// Correct reply within the timeout
    Alive,
    /// Peer reachable but no (or wrong) reply in time; process likely hung
    Timeout,
    /// Peer cannot be contacted at all; process likely dead
    Unreachable,
}

/// Result of one probe, consumed immediately by the restart decision
#[derive(Debug, Clone)]
pub struct LivenessVerdict {
    pub target: Role,
    pub outcome: LivenessOutcome,
    pub timestamp: DateTime<Utc>,
}

impl LivenessVerdict {
    pub fn new(target: Role, outcome: LivenessOutcome) -> Self {
        Self {
            target,
            outcome,
            timestamp: Utc::now(),
        }
    }
}

/// A way of asking a supervised process whether it is alive
#[async_trait]
pub trait LivenessStrategy: Send {
    /// Probe the process behind `record` within the strategy's timeout
    async fn probe(&mut self, record: &ProcessRecord) -> LivenessVerdict;

    /// Strategy name for logs
    fn name(&self) -> &'static str;
}
