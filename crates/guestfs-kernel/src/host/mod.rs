//! Host I/O primitives.
//!
//! The engine never touches `std::fs` directly. Everything goes through one
//! [`HostIo`] instance handed to [`FileSystem`](crate::FileSystem) at
//! construction:
//!
//! - [`LocalHostIo`] - the real disk
//! - [`MemoryHostIo`] - an in-memory tree, for tests and scratch machines
//!
//! Paths passed in are host paths: a mount root joined with clean guest
//! segments.

mod local;
mod memory;

use std::fmt;
use std::io::{self, Read, Seek, Write};
use std::path::Path;
use std::time::SystemTime;

use serde::Serialize;

use crate::mode::OpenMode;

pub use local::LocalHostIo;
pub use memory::MemoryHostIo;

/// Metadata for one host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStat {
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

/// Filesystem statistics for the volume holding a host path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostStatVfs {
    /// Total blocks.
    pub blocks: u64,
    /// Blocks available to unprivileged users.
    pub bavail: u64,
    /// Block size in bytes.
    pub bsize: u64,
}

impl HostStatVfs {
    /// Bytes available to the guest.
    pub fn available_bytes(&self) -> u64 {
        self.bavail.saturating_mul(self.bsize)
    }

    /// Total volume size in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.blocks.saturating_mul(self.bsize)
    }
}

impl Default for HostStatVfs {
    fn default() -> Self {
        Self {
            blocks: 1024 * 1024, // 1M blocks
            bavail: 512 * 1024,  // 512K free
            bsize: 4096,
        }
    }
}

/// An open host file.
pub trait HostFile: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> HostFile for T {}

/// The host I/O primitive set.
pub trait HostIo: Send + Sync + fmt::Debug {
    /// Metadata for a file or directory.
    fn stat(&self, path: &Path) -> io::Result<HostStat>;

    /// Create one directory. The parent must exist.
    fn mkdir(&self, path: &Path) -> io::Result<()>;

    /// Names of the entries in a directory, in no particular order.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Open a file with the semantics of `mode` (see [`OpenMode`]).
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn HostFile>>;

    /// Remove a file or an empty directory.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Rename within one volume.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Volume statistics for the volume holding `path`.
    fn statvfs(&self, path: &Path) -> io::Result<HostStatVfs>;

    /// Whether the host would let us write `path`. Hosts without a
    /// permission model keep the default.
    fn access_writable(&self, _path: &Path) -> io::Result<bool> {
        Ok(true)
    }
}
