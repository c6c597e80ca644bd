//! Cross-process index version counter
//!
//! A 4-byte file-backed shared mapping holding one `u32`. The daemon is the
//! only writer and bumps it with an atomic increment after every reload;
//! client caches map the same file read-only and compare the value with the
//! epoch they last saw.

use crate::utils::app_data::{get_runtime_dir, runtime_file_name};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

const SEGMENT_LEN: usize = std::mem::size_of::<u32>();

/// Default per-user location of the version segment
pub fn default_segment_path() -> PathBuf {
    get_runtime_dir().join(runtime_file_name("version"))
}

enum Mapping {
    Writer(MmapMut),
    Reader(Mmap),
}

/// Shared version counter backed by a memory-mapped file
pub struct VersionSegment {
    mapping: Mapping,
    path: PathBuf,
}

impl std::fmt::Debug for VersionSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSegment")
            .field("path", &self.path)
            .field("writable", &matches!(self.mapping, Mapping::Writer(_)))
            .field("value", &self.load())
            .finish()
    }
}

impl VersionSegment {
    /// Create (or reuse) the per-user segment with write access
    pub fn create() -> io::Result<Self> {
        Self::create_at(&default_segment_path())
    }

    /// Create (or reuse) a segment at `path` with write access
    pub fn create_at(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.metadata()?.len() < SEGMENT_LEN as u64 {
            file.set_len(SEGMENT_LEN as u64)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
        }

        // Safety: the file is at least SEGMENT_LEN bytes and only ever accessed
        // through the atomic below
        let map = unsafe { MmapOptions::new().len(SEGMENT_LEN).map_mut(&file)? };

        Ok(Self {
            mapping: Mapping::Writer(map),
            path: path.to_path_buf(),
        })
    }

    /// Open the per-user segment read-only; fails if the daemon never created it
    pub fn open() -> io::Result<Self> {
        Self::open_at(&default_segment_path())
    }

    /// Open an existing segment at `path` read-only
    pub fn open_at(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;

        if file.metadata()?.len() < SEGMENT_LEN as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "version segment is truncated",
            ));
        }

        // Safety: length checked above; accessed only through the atomic below
        let map = unsafe { MmapOptions::new().len(SEGMENT_LEN).map(&file)? };

        Ok(Self {
            mapping: Mapping::Reader(map),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn counter(&self) -> &AtomicU32 {
        let ptr = match &self.mapping {
            Mapping::Writer(map) => map.as_ptr(),
            Mapping::Reader(map) => map.as_ptr(),
        };
        debug_assert_eq!(ptr as usize % std::mem::align_of::<AtomicU32>(), 0);
        // Safety: mappings are page aligned, SEGMENT_LEN bytes long and live as
        // long as self
        unsafe { &*(ptr as *const AtomicU32) }
    }

    /// Current counter value
    pub fn load(&self) -> u32 {
        self.counter().load(Ordering::SeqCst)
    }

    /// Increment the counter, returning the new value
    ///
    /// Only the daemon bumps the counter; read-only handles return an error.
    pub fn bump(&self) -> io::Result<u32> {
        match &self.mapping {
            Mapping::Writer(_) => Ok(self.counter().fetch_add(1, Ordering::SeqCst).wrapping_add(1)),
            Mapping::Reader(_) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "version segment is mapped read-only",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_is_visible_to_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.version");

        let writer = VersionSegment::create_at(&path).unwrap();
        let reader = VersionSegment::open_at(&path).unwrap();
        let start = writer.load();
        assert_eq!(reader.load(), start);

        assert_eq!(writer.bump().unwrap(), start.wrapping_add(1));
        assert_eq!(reader.load(), start.wrapping_add(1));
        assert_eq!(writer.bump().unwrap(), start.wrapping_add(2));
        assert_eq!(reader.load(), start.wrapping_add(2));
    }

    #[test]
    fn test_reader_cannot_bump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.version");
        let _writer = VersionSegment::create_at(&path).unwrap();
        let reader = VersionSegment::open_at(&path).unwrap();
        assert!(reader.bump().is_err());
    }

    #[test]
    fn test_open_missing_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(VersionSegment::open_at(&dir.path().join("missing.version")).is_err());
    }

    #[test]
    fn test_value_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.version");
        {
            let writer = VersionSegment::create_at(&path).unwrap();
            writer.bump().unwrap();
            writer.bump().unwrap();
        }
        let writer = VersionSegment::create_at(&path).unwrap();
        assert_eq!(writer.load(), 2);
    }
}
