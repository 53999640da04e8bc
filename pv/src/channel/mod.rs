//! Inter-process task channel
//!
//! A channel is a pair of named FIFOs, one per direction, carrying
//! newline-delimited UTF-8 lines between the dispatcher and the worker. The
//! dispatcher creates and removes both conduits; each side opens one reading
//! and one writing endpoint, and the open blocks until the peer has opened
//! the matching end.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tracing::debug;

pub mod endpoint;
pub mod messages;

pub use endpoint::{ChannelError, ChannelReader, ChannelWriter};
pub use messages::ControlMessage;

/// Conduit filenames under the runtime directory
const TASK_IN: &str = "task.in";
const TASK_OUT: &str = "task.out";

/// Paths of the two conduits of a dispatcher<->worker pair
#[derive(Debug, Clone)]
pub struct ConduitPair {
    /// dispatcher -> worker
    pub task_in: PathBuf,
    /// worker -> dispatcher
    pub task_out: PathBuf,
}

/// Conduit paths under `dir` (no filesystem access)
pub fn conduit_paths(dir: &Path) -> ConduitPair {
    ConduitPair {
        task_in: dir.join(TASK_IN),
        task_out: dir.join(TASK_OUT),
    }
}

/// Create both conduits, replacing stale ones from a previous run
///
/// Dispatcher-only: the creator is also the process that removes them.
pub fn create_conduits(dir: &Path) -> Result<ConduitPair> {
    debug!(?dir, "create_conduits: called");
    std::fs::create_dir_all(dir).context("Failed to create conduit directory")?;

    let pair = conduit_paths(dir);
    for path in [&pair.task_in, &pair.task_out] {
        if path.exists() {
            debug!(?path, "create_conduits: removing stale conduit");
            std::fs::remove_file(path).context("Failed to remove stale conduit")?;
        }
        nix::unistd::mkfifo(path.as_path(), nix::sys::stat::Mode::from_bits_truncate(0o600))
            .context(format!("Failed to create conduit {}", path.display()))?;
        debug!(?path, "create_conduits: created conduit");
    }
    Ok(pair)
}

/// Unlink both conduits; missing files are not an error
pub fn remove_conduits(dir: &Path) -> Result<()> {
    debug!(?dir, "remove_conduits: called");
    let pair = conduit_paths(dir);
    for path in [&pair.task_in, &pair.task_out] {
        if path.exists() {
            std::fs::remove_file(path).context(format!("Failed to remove conduit {}", path.display()))?;
            debug!(?path, "remove_conduits: removed conduit");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_remove_conduits() {
        let temp_dir = TempDir::new().unwrap();
        let pair = create_conduits(temp_dir.path()).unwrap();
        assert!(pair.task_in.exists());
        assert!(pair.task_out.exists());

        remove_conduits(temp_dir.path()).unwrap();
        assert!(!pair.task_in.exists());
        assert!(!pair.task_out.exists());
    }

    #[test]
    fn test_create_replaces_stale_conduits() {
        let temp_dir = TempDir::new().unwrap();
        // A stale regular file where the FIFO should be
        let stale = temp_dir.path().join(TASK_IN);
        std::fs::write(&stale, "stale").unwrap();

        let pair = create_conduits(temp_dir.path()).unwrap();
        assert!(pair.task_in.exists());
        // Recreated as a FIFO, not the old regular file
        use std::os::unix::fs::FileTypeExt;
        let ft = std::fs::metadata(&pair.task_in).unwrap().file_type();
        assert!(ft.is_fifo());
    }

    #[test]
    fn test_remove_missing_conduits_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        remove_conduits(temp_dir.path()).unwrap();
    }
}
