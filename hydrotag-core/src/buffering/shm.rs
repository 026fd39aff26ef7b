//! Named, file-backed shared-memory segments.
//!
//! Segments live as plain files in a tmpfs directory (`/dev/shm` on the tag)
//! and are mapped with `memmap2`. Any process that knows the directory and
//! name can map the same bytes; observers map them read-only.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::error::{HydroError, Result};

/// Default segment directory on Linux.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// A read-write mapping of a named segment.
///
/// # Safety
/// The mapping stays valid for the lifetime of the value. Concurrent access
/// to the bytes must be coordinated by the owner (see `SharedRing`).
pub struct ShmSegment {
    path: PathBuf,
    map: MmapMut,
}

impl ShmSegment {
    /// Map `dir/name`, creating it if absent and sizing it to exactly `len`
    /// bytes. A segment left behind by an earlier session with a different
    /// geometry is resized.
    pub fn create_or_open(dir: &Path, name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(HydroError::SharedMemory(format!(
                "segment {name} must not be empty"
            )));
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| HydroError::SharedMemory(format!("open {}: {e}", path.display())))?;

        let existing = file.metadata()?.len();
        if existing != len as u64 {
            if existing != 0 {
                warn!(
                    path = %path.display(),
                    existing,
                    requested = len,
                    "resizing shared segment left by a previous session"
                );
            }
            file.set_len(len as u64)?;
        }

        // SAFETY: the file was just sized to `len`; the mapping owns its own
        // reference to the file and stays valid until dropped.
        let map = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| HydroError::SharedMemory(format!("map {}: {e}", path.display())))?
        };
        debug!(path = %path.display(), len, "shared segment mapped");
        Ok(Self { path, map })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Base pointer of the mapping. Valid while `self` is alive.
    pub(crate) fn base_ptr(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("path", &self.path)
            .field("len", &self.map.len())
            .finish()
    }
}

/// A read-only mapping of an existing segment, for observers.
pub struct ReadOnlySegment {
    map: Mmap,
}

impl ReadOnlySegment {
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| HydroError::SharedMemory(format!("open {}: {e}", path.display())))?;
        // SAFETY: read-only mapping; the producer may keep writing, which
        // observers tolerate by validating sequence numbers after each copy.
        let map = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| HydroError::SharedMemory(format!("map {}: {e}", path.display())))?
        };
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn base_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }
}
