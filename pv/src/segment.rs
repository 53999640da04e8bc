//! Shared segment lifecycle
//!
//! A fixed-size named shared-memory block used for one-shot initial data
//! handoff from the dispatcher to the worker. The dispatcher creates the
//! segment and writes the initialization marker before spawning the worker;
//! the worker attaches read-only and validates the marker. Only the creator
//! unlinks the OS object, tracked by an `owner` flag on the handle rather
//! than by convention.

use shared_memory::{Shmem, ShmemConf, ShmemError};
use thiserror::Error;
use tracing::{debug, info};

/// Initialization marker the creator writes into the first bytes
pub const INIT_MARKER: [u8; 10] = [74, 73, 72, 71, 70, 69, 68, 67, 66, 65];

/// Errors from segment operations
#[derive(Debug, Error)]
pub enum SegmentError {
    /// The segment cannot be attached; fatal at process startup
    #[error("shared segment unavailable: {0}")]
    Unavailable(ShmemError),

    /// The local mapping was already released
    #[error("segment already detached")]
    AlreadyDetached,

    /// Destroy called through a non-creator handle
    #[error("only the segment creator may destroy it")]
    NotOwner,

    /// First bytes do not match [`INIT_MARKER`]
    #[error("segment initialization marker mismatch")]
    BadMarker,

    #[error("shared memory error: {0}")]
    Shmem(#[from] ShmemError),
}

/// Handle to the named shared segment
///
/// The mapping lives in an `Option` so that releasing it twice is an error
/// rather than a double-unmap, and so a consumed (destroyed) handle cannot
/// unlink again.
pub struct SharedSegment {
    name: String,
    owner: bool,
    shmem: Option<Shmem>,
}

impl SharedSegment {
    /// Create the segment, recovering from a stale instance left by a
    /// previous run, and write the initialization marker.
    ///
    /// Creator-side entry point; the returned handle owns the OS object.
    pub fn create(name: &str, size: usize) -> Result<Self, SegmentError> {
        debug!(name, size, "SharedSegment::create: called");
        assert!(size >= INIT_MARKER.len(), "segment smaller than the init marker");

        let shmem = match ShmemConf::new().os_id(name).size(size).create() {
            Ok(shmem) => shmem,
            Err(ShmemError::MappingIdExists) => {
                // Stale segment from a previous run: take ownership of it,
                // unlink it, then create fresh.
                info!(name, "Recovering stale shared segment");
                let mut stale = ShmemConf::new().os_id(name).open()?;
                stale.set_owner(true);
                drop(stale);
                ShmemConf::new().os_id(name).size(size).create()?
            }
            Err(e) => return Err(SegmentError::Shmem(e)),
        };

        // One-shot handoff payload, written exactly once before the segment
        // is published; attachers treat the bytes as read-only.
        unsafe {
            std::ptr::copy_nonoverlapping(INIT_MARKER.as_ptr(), shmem.as_ptr(), INIT_MARKER.len());
        }

        info!(name, size, "Created shared segment");
        Ok(Self {
            name: name.to_string(),
            owner: true,
            shmem: Some(shmem),
        })
    }

    /// Attach to an existing segment
    ///
    /// Attacher-side entry point; the returned handle never unlinks the OS
    /// object. Failure here means the creator is gone or never ran.
    pub fn attach(name: &str) -> Result<Self, SegmentError> {
        debug!(name, "SharedSegment::attach: called");
        let mut shmem = ShmemConf::new().os_id(name).open().map_err(SegmentError::Unavailable)?;
        shmem.set_owner(false);

        info!(name, size = shmem.len(), "Attached shared segment");
        Ok(Self {
            name: name.to_string(),
            owner: false,
            shmem: Some(shmem),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created (and owns) the OS object
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Mapped size in bytes
    pub fn size(&self) -> Result<usize, SegmentError> {
        Ok(self.mapped()?.len())
    }

    /// Copy out the first `n` bytes
    pub fn read(&self, n: usize) -> Result<Vec<u8>, SegmentError> {
        let shmem = self.mapped()?;
        let n = n.min(shmem.len());
        let bytes = unsafe { std::slice::from_raw_parts(shmem.as_ptr(), n) };
        Ok(bytes.to_vec())
    }

    /// Check the initialization marker the creator wrote
    pub fn verify_marker(&self) -> Result<(), SegmentError> {
        let head = self.read(INIT_MARKER.len())?;
        if head != INIT_MARKER {
            return Err(SegmentError::BadMarker);
        }
        Ok(())
    }

    /// Release the local mapping without unlinking the OS object
    ///
    /// Calling this twice returns [`SegmentError::AlreadyDetached`].
    pub fn detach(&mut self) -> Result<(), SegmentError> {
        debug!(name = %self.name, "SharedSegment::detach: called");
        match self.shmem.take() {
            None => Err(SegmentError::AlreadyDetached),
            Some(mut shmem) => {
                shmem.set_owner(false);
                drop(shmem);
                debug!(name = %self.name, "SharedSegment::detach: released mapping");
                Ok(())
            }
        }
    }

    /// Unlink the OS object (creator-only)
    ///
    /// Consumes the mapping, so a second destroy is unreachable through
    /// this handle; non-creator handles are rejected.
    pub fn destroy(&mut self) -> Result<(), SegmentError> {
        debug!(name = %self.name, owner = self.owner, "SharedSegment::destroy: called");
        if !self.owner {
            return Err(SegmentError::NotOwner);
        }
        match self.shmem.take() {
            None => Err(SegmentError::AlreadyDetached),
            Some(shmem) => {
                // Owner drop unmaps and unlinks
                drop(shmem);
                info!(name = %self.name, "Destroyed shared segment");
                Ok(())
            }
        }
    }

    fn mapped(&self) -> Result<&Shmem, SegmentError> {
        self.shmem.as_ref().ok_or(SegmentError::AlreadyDetached)
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("attached", &self.shmem.is_some())
            .finish()
    }
}
