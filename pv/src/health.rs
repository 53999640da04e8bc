//! Health-check listener
//!
//! Every supervised process exposes a TCP socket on which the watchdog
//! probes it: one probe token line in, one role-identifying reply line out.
//! The listener runs as its own task beside the process's primary loop, so
//! probes are answered even while a relay or serve loop is busy, and it
//! honors the shutdown token within one poll cycle.

use std::io;
use std::net::SocketAddr;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::messages::{HEALTH_PROBE, health_reply};
use crate::process::Role;

/// Bind a TCP listener, reporting a conflicting instance distinctly
///
/// A port already in use signals another instance of the same role; fatal at
/// startup.
pub async fn bind_listener(addr: &str) -> Result<TcpListener> {
    debug!(addr, "bind_listener: called");
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(eyre::eyre!(
            "port already in use at {}: is another instance running?",
            addr
        )),
        Err(e) => Err(e).context(format!("Failed to bind {}", addr)),
    }
}

/// Running health listener task
pub struct HealthListener {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl HealthListener {
    /// Bind `addr` and start answering probes for `role`
    pub async fn spawn(addr: &str, role: Role, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let listener = bind_listener(addr).await?;
        let local_addr = listener.local_addr().context("Failed to read listener address")?;
        info!(%local_addr, %role, "Health listener ready");

        let handle = tokio::spawn(accept_loop(listener, role, shutdown));
        Ok(Self { local_addr, handle })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listening socket and stop the task
    pub async fn stop(self) {
        debug!(addr = %self.local_addr, "HealthListener::stop: called");
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn accept_loop(listener: TcpListener, role: Role, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(%role, "accept_loop: shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, %role, "accept_loop: probe connection");
                        serve_probes(stream, role, &mut shutdown).await;
                    }
                    Err(e) => {
                        warn!(%role, error = %e, "Health accept failed");
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(%role, "accept_loop: health listener closed");
}

/// Answer probe lines on one connection until the prober disconnects
///
/// The watchdog opens a fresh connection per probe, so connections are
/// short-lived; unknown lines are logged and ignored.
async fn serve_probes(stream: TcpStream, role: Role, shutdown: &mut watch::Receiver<bool>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line == HEALTH_PROBE => {
                        let reply = format!("{}\n", health_reply(role));
                        if let Err(e) = write_half.write_all(reply.as_bytes()).await {
                            debug!(%role, error = %e, "serve_probes: reply failed");
                            break;
                        }
                    }
                    Ok(Some(line)) => {
                        debug!(%role, %line, "serve_probes: ignoring unrecognized line");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(%role, error = %e, "serve_probes: read failed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn probe_once(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(format!("{}\n", HEALTH_PROBE).as_bytes()).await.unwrap();

        let (read_half, _write_half) = stream.split();
        let mut lines = BufReader::new(read_half).lines();
        tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_probe_gets_identifying_reply() {
        let (_tx, rx) = watch::channel(false);
        let listener = HealthListener::spawn("127.0.0.1:0", Role::Worker, rx).await.unwrap();

        assert_eq!(probe_once(listener.local_addr()).await, "worker-alive");
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_reply_identifies_the_role() {
        let (_tx, rx) = watch::channel(false);
        let listener = HealthListener::spawn("127.0.0.1:0", Role::Dispatcher, rx).await.unwrap();

        assert_eq!(probe_once(listener.local_addr()).await, "dispatcher-alive");
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_line_is_ignored_then_probe_answered() {
        let (_tx, rx) = watch::channel(false);
        let listener = HealthListener::spawn("127.0.0.1:0", Role::Worker, rx).await.unwrap();

        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        stream.write_all(b"definitely-not-a-probe\n").await.unwrap();
        stream.write_all(format!("{}\n", HEALTH_PROBE).as_bytes()).await.unwrap();

        let (read_half, _write_half) = stream.split();
        let mut lines = BufReader::new(read_half).lines();
        let reply = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, "worker-alive");
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_probe_after_stop_is_refused() {
        let (_tx, rx) = watch::channel(false);
        let listener = HealthListener::spawn("127.0.0.1:0", Role::Worker, rx).await.unwrap();
        let addr = listener.local_addr();
        listener.stop().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let (_tx, rx) = watch::channel(false);
        let listener = HealthListener::spawn("127.0.0.1:0", Role::Worker, rx).await.unwrap();
        let addr = listener.local_addr();

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        assert!(err.to_string().contains("already in use"));
        listener.stop().await;
    }
}
