//! # guestfs-kernel
//!
//! The guest filesystem of a sandboxed virtual computer. Guest programs see
//! one `/`-rooted tree assembled from host directories and read-only mmfs
//! images, and nothing they name can reach the host outside a mount root.
//!
//! - [`FileSystem`] - the engine: mounts, queries, copy/move/delete, open
//! - [`GuestPath`] - normalized segment lists, `..` policy
//! - [`MountTable`] - ordered mounts with a per-point limit
//! - [`Resolver`] - exists, create-parents and union resolution
//! - [`HostIo`] - host primitives; [`LocalHostIo`] and [`MemoryHostIo`]
//! - [`FileHandle`] - open files over host files or archive slices
//! - [`MachineConfig`] - TOML machine descriptions
//!
//! ## Design Decisions
//!
//! - **Deepest mount wins**: only mounts sharing the longest matching point
//!   are probed; registration order breaks ties.
//! - **Mount directories are virtual**: ancestors of mount points list and
//!   stat as read-only directories even when no backend holds them.
//! - **Checks before effects**: copy and move validate both ends before
//!   touching the host.

mod config;
mod error;
mod fs;
mod handle;
pub mod host;
mod mode;
mod mount;
pub mod path;
mod resolve;
mod walk;

pub use config::{FsConfig, MachineConfig, MountConfig};
pub use error::{FsError, FsResult};
pub use fs::{FileAttributes, FileSystem};
pub use handle::FileHandle;
pub use host::{HostFile, HostIo, HostStat, HostStatVfs, LocalHostIo, MemoryHostIo};
pub use mode::{ModeKind, OpenMode, SeekWhence};
pub use mount::{Backend, Mount, MountId, MountTable};
pub use path::{DotDotPolicy, GuestPath, combine, get_dir, get_name};
pub use resolve::{NodeKind, Resolved, Resolver, WriteTarget};
pub use walk::{MountTree, TreeSource, WalkEntry, Walker};
