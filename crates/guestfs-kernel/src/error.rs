//! Filesystem error types.
//!
//! Path-carrying variants hold the normalized guest path without its leading
//! slash and render as `/<path>: <message>`, the form scripts see.

use std::io;

use guestfs_mmfs::MmfsError;
use thiserror::Error;

/// Guest filesystem error type.
#[derive(Debug, Error)]
pub enum FsError {
    /// Nothing exists at the path.
    #[error("/{0}: No such file")]
    NotFound(String),

    /// A directory was required.
    #[error("/{0}: Not a directory")]
    NotADirectory(String),

    /// A file was required (opening a directory for reading).
    #[error("/{0}: Not a file")]
    NotAFile(String),

    /// Opening a directory for writing.
    #[error("/{0}: Cannot write to directory")]
    CannotWriteToDirectory(String),

    /// Read-only mount, archive mount, or mount root.
    #[error("/{0}: Access denied")]
    PermissionDenied(String),

    /// A `..` escaping the root, or a copy/move into its own subtree.
    #[error("/{0}: Invalid path")]
    InvalidPath(String),

    /// Mode string outside `r`/`w`/`a` plus `+`, `b` or `+b`.
    #[error("{0}: Unsupported mode")]
    UnsupportedMode(String),

    /// The per-machine open-file budget is spent.
    #[error("/{0}: Too many files already open")]
    TooManyOpenFiles(String),

    /// Destination already exists.
    #[error("/{0}: File exists")]
    AlreadyExists(String),

    /// Bad magic, or an archive offset outside the image.
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// One mount too many at a single mount point.
    #[error("/{path}: Too many mounts at this point (limit {limit})")]
    MountCapacity { path: String, limit: usize },

    /// Operation on a handle after `close`.
    #[error("attempt to use a closed file")]
    ClosedFile,

    /// Handle opened without the capability (e.g. writing a read handle).
    #[error("handle does not support {0}")]
    Unsupported(&'static str),

    /// Host I/O error passed through.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Map a host I/O error, attaching the guest path where the kind has a
    /// dedicated variant.
    pub fn from_host(err: io::Error, path: impl Into<String>) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.into()),
            io::ErrorKind::NotADirectory => Self::NotADirectory(path.into()),
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::PermissionDenied(path.into())
            }
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.into()),
            _ => Self::Io(err),
        }
    }

    /// Map an archive error, attaching the guest path for lookup misses.
    pub fn from_archive(err: MmfsError, path: impl Into<String>) -> Self {
        match err {
            MmfsError::NotFound(_) => Self::NotFound(path.into()),
            MmfsError::NotADirectory(_) => Self::NotADirectory(path.into()),
            MmfsError::Io(e) => Self::Io(e),
            other => Self::ArchiveCorrupt(other.to_string()),
        }
    }
}

impl From<MmfsError> for FsError {
    fn from(e: MmfsError) -> Self {
        match e {
            MmfsError::NotFound(p) => Self::NotFound(p),
            MmfsError::NotADirectory(p) => Self::NotADirectory(p),
            MmfsError::Io(e) => Self::Io(e),
            other => Self::ArchiveCorrupt(other.to_string()),
        }
    }
}

/// Convert FsError to std::io::Error for compatibility.
impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        let msg = e.to_string();
        match e {
            FsError::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, msg),
            FsError::NotADirectory(_) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            FsError::NotAFile(_) | FsError::CannotWriteToDirectory(_) => {
                io::Error::new(io::ErrorKind::IsADirectory, msg)
            }
            FsError::PermissionDenied(_) => io::Error::new(io::ErrorKind::PermissionDenied, msg),
            FsError::InvalidPath(_) | FsError::UnsupportedMode(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, msg)
            }
            FsError::AlreadyExists(_) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            FsError::ArchiveCorrupt(_) => io::Error::new(io::ErrorKind::InvalidData, msg),
            FsError::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, msg),
            FsError::Io(e) => e,
            FsError::TooManyOpenFiles(_) | FsError::MountCapacity { .. } | FsError::ClosedFile => {
                io::Error::other(msg)
            }
        }
    }
}

/// Filesystem result type.
pub type FsResult<T> = Result<T, FsError>;
