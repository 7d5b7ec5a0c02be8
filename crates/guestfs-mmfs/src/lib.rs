//! # guestfs-mmfs
//!
//! The mmfs archive format: a read-only directory tree packed into one flat,
//! memory-resident buffer. Used to ship a ROM image without a real
//! filesystem underneath.
//!
//! - [`Archive`] - validated shared image, path traversal, zero-copy data
//! - [`DirView`] - one bounds-checked directory table, binary-searchable
//! - [`FileSlice`] - `Read + BufRead + Seek` cursor over one file
//! - [`ArchiveBuilder`] - packs host directories or in-memory trees
//!
//! Every offset read from the image is checked against the buffer length
//! before use; malformed images surface as [`MmfsError::Corrupt`].

mod archive;
mod builder;
mod error;
mod format;
mod slice;

pub use archive::{Archive, DirView, Entry};
pub use builder::ArchiveBuilder;
pub use error::{MmfsError, MmfsResult};
pub use format::{ENTRY_SIZE, HEADER_SIZE, MAGIC, MAX_FILE_SIZE, MAX_NAME_LEN, NAME_FIELD_LEN};
pub use slice::FileSlice;
