//! Archive error types.

use std::io;
use thiserror::Error;

/// mmfs error type.
#[derive(Debug, Error)]
pub enum MmfsError {
    /// No entry with this name in the directory searched.
    #[error("not found: {0}")]
    NotFound(String),

    /// A file was found where a directory was required.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Bad magic, an offset/count that points outside the image, or an
    /// entry that cannot be used as a path segment.
    #[error("corrupt archive: {0}")]
    Corrupt(String),

    /// Entry name is empty, contains `/` or NUL, or exceeds the name field.
    #[error("invalid entry name: {0:?}")]
    InvalidName(String),

    /// Entry already present in the builder.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// File content does not fit the 31-bit size field.
    #[error("file too large for archive: {name} ({size} bytes)")]
    FileTooLarge { name: String, size: usize },

    /// Image would exceed the 32-bit offset space.
    #[error("archive image exceeds 4 GiB")]
    ImageTooLarge,

    /// I/O error while packing a host directory.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MmfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create a Corrupt error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create an InvalidName error.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName(name.into())
    }
}

/// mmfs result type.
pub type MmfsResult<T> = Result<T, MmfsError>;
