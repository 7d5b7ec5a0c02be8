//! Mount table.
//!
//! An ordered list of mount records. Several mounts may share a point (up to
//! a configurable limit) and points may nest. Registration order is the
//! tie-break for resolution and union listing.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use guestfs_mmfs::Archive;

use crate::error::{FsError, FsResult};
use crate::path::GuestPath;

/// Identifies one registration in a [`MountTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(u64);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mount#{}", self.0)
    }
}

/// Storage behind a mount.
#[derive(Debug, Clone)]
pub enum Backend {
    /// A host directory, reached through the engine's `HostIo`.
    Host { root: PathBuf },
    /// An in-memory mmfs image. Always read-only.
    Archive(Archive),
}

impl Backend {
    pub fn is_archive(&self) -> bool {
        matches!(self, Backend::Archive(_))
    }
}

/// One mount record.
#[derive(Debug, Clone)]
pub struct Mount {
    id: MountId,
    point: GuestPath,
    backend: Backend,
    read_only: bool,
}

impl Mount {
    pub fn id(&self) -> MountId {
        self.id
    }

    /// Mount point, e.g. `rom`. The root mount has an empty point.
    pub fn point(&self) -> &GuestPath {
        &self.point
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Host path for segments below the mount point, or `None` for archives.
    pub fn host_path(&self, rest: &[String]) -> Option<PathBuf> {
        match &self.backend {
            Backend::Host { root } => Some(join_host(root, rest)),
            Backend::Archive(_) => None,
        }
    }

    /// Drive label: `hdd` for the root mount, otherwise the mount point.
    pub fn drive(&self) -> String {
        if self.point.is_root() {
            "hdd".to_string()
        } else {
            self.point.to_string()
        }
    }
}

pub(crate) fn join_host(root: &Path, rest: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(rest);
    path
}

/// Ordered mount records with a per-point capacity.
#[derive(Debug)]
pub struct MountTable {
    mounts: Vec<Mount>,
    next_id: u64,
    max_per_point: usize,
}

impl MountTable {
    /// Create an empty table allowing `max_per_point` mounts at one point.
    pub fn new(max_per_point: usize) -> Self {
        Self {
            mounts: Vec::new(),
            next_id: 0,
            max_per_point,
        }
    }

    /// Append a mount record. Archives are forced read-only.
    ///
    /// Fails with [`FsError::MountCapacity`] when the point already holds
    /// `max_per_point` mounts; the table is left unchanged.
    pub fn register(
        &mut self,
        point: GuestPath,
        backend: Backend,
        read_only: bool,
    ) -> FsResult<MountId> {
        let at_point = self.mounts.iter().filter(|m| m.point == point).count();
        if at_point >= self.max_per_point {
            tracing::warn!(point = %point, limit = self.max_per_point, "mount capacity reached");
            return Err(FsError::MountCapacity {
                path: point.to_string(),
                limit: self.max_per_point,
            });
        }

        let id = MountId(self.next_id);
        self.next_id += 1;
        let read_only = read_only || backend.is_archive();
        tracing::debug!(%id, point = %point, read_only, archive = backend.is_archive(), "registered mount");
        self.mounts.push(Mount {
            id,
            point,
            backend,
            read_only,
        });
        Ok(id)
    }

    /// Remove every mount at exactly `point`. Returns how many were removed.
    pub fn unregister_all_at(&mut self, point: &GuestPath) -> usize {
        let before = self.mounts.len();
        self.mounts.retain(|m| &m.point != point);
        let removed = before - self.mounts.len();
        if removed > 0 {
            tracing::debug!(point = %point, removed, "unregistered mounts");
        }
        removed
    }

    /// Remove one mount by id.
    pub fn unregister(&mut self, id: MountId) -> bool {
        let before = self.mounts.len();
        self.mounts.retain(|m| m.id != id);
        before != self.mounts.len()
    }

    /// Mounts in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter()
    }

    pub fn get(&self, id: MountId) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn max_per_point(&self) -> usize {
        self.max_per_point
    }

    /// Mounts whose point is a prefix of `path`, keeping only the deepest
    /// point length, in registration order.
    pub fn candidates(&self, path: &GuestPath) -> Vec<&Mount> {
        let Some(depth) = self
            .mounts
            .iter()
            .filter(|m| path.starts_with(&m.point))
            .map(|m| m.point.len())
            .max()
        else {
            return Vec::new();
        };
        self.mounts
            .iter()
            .filter(|m| m.point.len() == depth && path.starts_with(&m.point))
            .collect()
    }

    /// First segment below `path` of every mount point strictly deeper than
    /// `path`.
    pub fn children_below(&self, path: &GuestPath) -> BTreeSet<String> {
        self.mounts
            .iter()
            .filter_map(|m| m.point.strip_prefix(path))
            .filter_map(|rest| rest.first().cloned())
            .collect()
    }

    /// Whether some mount sits exactly at `path`.
    pub fn is_mount_point(&self, path: &GuestPath) -> bool {
        self.mounts.iter().any(|m| &m.point == path)
    }

    /// Whether `path` is a strict ancestor of some mount point, and so acts
    /// as a directory even when no backend holds it.
    pub fn is_mount_ancestor(&self, path: &GuestPath) -> bool {
        self.mounts
            .iter()
            .any(|m| m.point.len() > path.len() && m.point.starts_with(path))
    }
}
