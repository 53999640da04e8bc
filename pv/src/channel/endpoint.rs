//! Directional channel endpoints over named FIFOs
//!
//! Opening an endpoint uses real FIFO open semantics: the call blocks until
//! the peer process has opened the matching end, bounded by an open timeout.
//! All receives take an explicit timeout; an unbounded blocking read is
//! forbidden on any path that must also respond to shutdown requests.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tracing::debug;

/// Errors at the channel layer
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer closed its end mid-write (process likely died)
    #[error("channel peer closed its end")]
    Broken,

    /// The peer closed without sending a complete line
    #[error("channel closed by peer")]
    Closed,

    /// No line arrived (or no peer opened) within the timeout
    #[error("timed out waiting on channel")]
    Timeout,

    /// Outgoing message contains an embedded line separator
    #[error("message contains an embedded line separator")]
    EmbeddedNewline,

    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Open one end of a FIFO on a detached thread, so a peer that never shows
/// up blocks that thread and not the runtime.
async fn open_blocking(path: &Path, write: bool, open_timeout: Duration) -> Result<std::fs::File, ChannelError> {
    let path_buf = path.to_path_buf();
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::spawn(move || {
        let result = if write {
            std::fs::OpenOptions::new().write(true).open(&path_buf)
        } else {
            std::fs::OpenOptions::new().read(true).open(&path_buf)
        };
        // Receiver gone means the open timed out; the file (if any) is
        // dropped here and the peer sees a transient open/close.
        let _ = tx.send(result);
    });

    match tokio::time::timeout(open_timeout, rx).await {
        Err(_) => Err(ChannelError::Timeout),
        Ok(Err(_)) => Err(ChannelError::Io(io::Error::other("open thread dropped"))),
        Ok(Ok(result)) => Ok(result?),
    }
}

fn set_nonblocking(file: &std::fs::File) -> io::Result<()> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    let bits = fcntl(file, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(bits) | OFlag::O_NONBLOCK;
    fcntl(file, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// Receiving end of one conduit
#[derive(Debug)]
pub struct ChannelReader {
    path: PathBuf,
    inner: BufReader<pipe::Receiver>,
}

impl ChannelReader {
    /// Open the read end of the FIFO at `path`
    ///
    /// Blocks until the peer opens the write end, up to `open_timeout`.
    pub async fn open(path: &Path, open_timeout: Duration) -> Result<Self, ChannelError> {
        debug!(?path, "ChannelReader::open: called");
        let file = open_blocking(path, false, open_timeout).await?;
        set_nonblocking(&file)?;
        let receiver = pipe::Receiver::from_file(file)?;
        debug!(?path, "ChannelReader::open: peer connected");
        Ok(Self {
            path: path.to_path_buf(),
            inner: BufReader::new(receiver),
        })
    }

    /// Await the next complete line, bounded by `timeout`
    pub async fn recv(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        let mut line = String::new();
        let n = tokio::time::timeout(timeout, self.inner.read_line(&mut line))
            .await
            .map_err(|_| ChannelError::Timeout)??;
        if n == 0 {
            debug!(path = ?self.path, "ChannelReader::recv: peer closed");
            return Err(ChannelError::Closed);
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(line)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sending end of one conduit
pub struct ChannelWriter {
    path: PathBuf,
    inner: pipe::Sender,
}

impl ChannelWriter {
    /// Open the write end of the FIFO at `path`
    ///
    /// Blocks until the peer opens the read end, up to `open_timeout`.
    pub async fn open(path: &Path, open_timeout: Duration) -> Result<Self, ChannelError> {
        debug!(?path, "ChannelWriter::open: called");
        let file = open_blocking(path, true, open_timeout).await?;
        set_nonblocking(&file)?;
        let sender = pipe::Sender::from_file(file)?;
        debug!(?path, "ChannelWriter::open: peer connected");
        Ok(Self {
            path: path.to_path_buf(),
            inner: sender,
        })
    }

    /// Write one framed line and flush
    pub async fn send(&mut self, msg: &str) -> Result<(), ChannelError> {
        if msg.contains('\n') {
            return Err(ChannelError::EmbeddedNewline);
        }

        let mut framed = Vec::with_capacity(msg.len() + 1);
        framed.extend_from_slice(msg.as_bytes());
        framed.push(b'\n');

        let map_broken = |e: io::Error| {
            if e.kind() == io::ErrorKind::BrokenPipe {
                ChannelError::Broken
            } else {
                ChannelError::Io(e)
            }
        };
        self.inner.write_all(&framed).await.map_err(map_broken)?;
        self.inner.flush().await.map_err(map_broken)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
