//! Socket-based liveness probing
//!
//! One fresh TCP connection per probe to the target's health-check port:
//! connection refused means the process is gone (unreachable); an accepted
//! connection with no correct reply in time means it is hung (timeout).

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::channel::messages::{HEALTH_PROBE, health_reply};
use crate::config::ListenConfig;
use crate::process::ProcessRecord;

use super::{LivenessOutcome, LivenessStrategy, LivenessVerdict};

/// TCP health-check probe
pub struct SocketProbe {
    listen: ListenConfig,
    timeout: Duration,
}

impl SocketProbe {
    pub fn new(listen: ListenConfig, timeout: Duration) -> Self {
        Self { listen, timeout }
    }

    async fn exchange(&self, addr: &str, expected: &str) -> LivenessOutcome {
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                debug!(addr, "SocketProbe: connect timed out");
                return LivenessOutcome::Unreachable;
            }
            Ok(Err(e)) => {
                debug!(addr, error = %e, "SocketProbe: connect failed");
                return LivenessOutcome::Unreachable;
            }
            Ok(Ok(stream)) => stream,
        };

        let (read_half, mut write_half) = stream.into_split();
        let probe_line = format!("{}\n", HEALTH_PROBE);
        if write_half.write_all(probe_line.as_bytes()).await.is_err() {
            return LivenessOutcome::Unreachable;
        }

        let mut lines = BufReader::new(read_half).lines();
        match tokio::time::timeout(self.timeout, lines.next_line()).await {
            Ok(Ok(Some(reply))) if reply == expected => LivenessOutcome::Alive,
            Ok(Ok(Some(reply))) => {
                debug!(addr, %reply, "SocketProbe: unexpected reply");
                LivenessOutcome::Timeout
            }
            Ok(Ok(None)) | Ok(Err(_)) => {
                debug!(addr, "SocketProbe: connection dropped before reply");
                LivenessOutcome::Timeout
            }
            Err(_) => {
                debug!(addr, "SocketProbe: reply timed out");
                LivenessOutcome::Timeout
            }
        }
    }
}

#[async_trait]
impl LivenessStrategy for SocketProbe {
    async fn probe(&mut self, record: &ProcessRecord) -> LivenessVerdict {
        let addr = self.listen.health_addr(record.role);
        let outcome = self.exchange(&addr, health_reply(record.role)).await;
        debug!(role = %record.role, pid = record.pid, ?outcome, "SocketProbe: verdict");
        LivenessVerdict::new(record.role, outcome)
    }

    fn name(&self) -> &'static str {
        "socket"
    }
}
