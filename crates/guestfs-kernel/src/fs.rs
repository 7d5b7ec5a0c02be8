//! The file operation engine.
//!
//! [`FileSystem`] owns one machine's mount table, host I/O and open-file
//! budget, and exposes the script-facing operations. Every operation
//! normalizes its path with [`DotDotPolicy::Strict`](crate::DotDotPolicy)
//! and resolves it against the mount table; nothing reaches the host
//! outside a mount root.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use guestfs_mmfs::Archive;
use serde::Serialize;

use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::handle::{FileHandle, OpenFileSlot, Stream};
use crate::host::HostIo;
use crate::mode::OpenMode;
use crate::mount::{Backend, Mount, MountId, MountTable, join_host};
use crate::path::GuestPath;
use crate::resolve::{NodeKind, Resolved, Resolver, WriteTarget};
use crate::walk::{MountTree, WalkEntry, Walker};

/// Metadata reported by [`FileSystem::attributes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttributes {
    pub size: u64,
    pub is_dir: bool,
    pub is_read_only: bool,
    /// Milliseconds since the Unix epoch, 0 when unknown.
    pub modified: u64,
    /// Milliseconds since the Unix epoch, 0 when unknown.
    pub created: u64,
}

/// Result of an exists-mode lookup that also knows about mount directories.
enum Lookup<'a> {
    Found(Resolved<'a>),
    /// A mount point, or an ancestor of one, that no backend holds.
    Virtual,
}

/// One machine's guest filesystem.
pub struct FileSystem {
    config: FsConfig,
    host: Arc<dyn HostIo>,
    mounts: MountTable,
    open_files: Arc<AtomicUsize>,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("mounts", &self.mounts.len())
            .field("open_files", &self.open_file_count())
            .finish()
    }
}

impl FileSystem {
    /// Create a machine with no mounts.
    pub fn new(host: impl HostIo + 'static, config: FsConfig) -> Self {
        Self::with_host(Arc::new(host), config)
    }

    /// Create a machine over a host I/O instance that may be shared.
    pub fn with_host(host: Arc<dyn HostIo>, config: FsConfig) -> Self {
        Self {
            mounts: MountTable::new(config.max_mounts_per_point),
            config,
            host,
            open_files: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn host(&self) -> &dyn HostIo {
        self.host.as_ref()
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Handles currently open against this machine.
    pub fn open_file_count(&self) -> usize {
        self.open_files.load(Ordering::Acquire)
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.mounts, self.host.as_ref())
    }

    // ------------------------------------------------------------------
    // Mounting
    // ------------------------------------------------------------------

    /// Expose host directory `root` at `guest_prefix`.
    pub fn mount_host_directory(
        &mut self,
        root: impl Into<PathBuf>,
        guest_prefix: &str,
        read_only: bool,
    ) -> FsResult<MountId> {
        let root = root.into();
        let point = GuestPath::parse(guest_prefix)?;
        let stat = self.host.stat(&root)?;
        if !stat.is_dir {
            return Err(FsError::not_a_directory(root.display().to_string()));
        }
        self.mounts.register(point, Backend::Host { root }, read_only)
    }

    /// Expose an mmfs image at `guest_prefix`, read-only. The image is
    /// validated before the mount is registered.
    pub fn mount_archive(
        &mut self,
        bytes: impl Into<Arc<[u8]>>,
        guest_prefix: &str,
    ) -> FsResult<MountId> {
        let archive = Archive::from_bytes(bytes).map_err(|e| FsError::ArchiveCorrupt(e.to_string()))?;
        self.mount_archive_image(archive, guest_prefix)
    }

    /// Mount an already opened image. Clones share the same buffer.
    pub fn mount_archive_image(&mut self, archive: Archive, guest_prefix: &str) -> FsResult<MountId> {
        let point = GuestPath::parse(guest_prefix)?;
        self.mounts.register(point, Backend::Archive(archive), true)
    }

    /// Remove every mount at exactly `guest_prefix`. Returns how many went.
    pub fn unmount(&mut self, guest_prefix: &str) -> FsResult<usize> {
        let point = GuestPath::parse(guest_prefix)?;
        Ok(self.mounts.unregister_all_at(&point))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn lookup(&self, path: &GuestPath) -> FsResult<Option<Lookup<'_>>> {
        match self.resolver().resolve_existing(path) {
            Ok(found) => Ok(Some(Lookup::Found(found))),
            Err(FsError::NotFound(_)) if self.is_virtual_dir(path) => Ok(Some(Lookup::Virtual)),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn is_virtual_dir(&self, path: &GuestPath) -> bool {
        self.mounts.is_mount_point(path) || self.mounts.is_mount_ancestor(path)
    }

    pub fn exists(&self, path: &str) -> FsResult<bool> {
        let path = GuestPath::parse(path)?;
        Ok(self.lookup(&path)?.is_some())
    }

    pub fn is_dir(&self, path: &str) -> FsResult<bool> {
        let path = GuestPath::parse(path)?;
        Ok(match self.lookup(&path)? {
            Some(Lookup::Found(found)) => found.kind.is_dir(),
            Some(Lookup::Virtual) => true,
            None => false,
        })
    }

    /// Whether a write at `path` would be refused.
    ///
    /// True on read-only mounts and mount directories. A missing path on a
    /// writable mount is not read-only; an existing one asks the host.
    pub fn is_read_only(&self, raw: &str) -> FsResult<bool> {
        let path = GuestPath::parse(raw)?;
        if matches!(self.lookup(&path)?, Some(Lookup::Virtual)) {
            return Ok(true);
        }
        let target = match self.resolver().nearest(&path) {
            Ok(target) => target,
            Err(FsError::NotFound(_) | FsError::NotADirectory(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if target.mount.is_read_only() {
            return Ok(true);
        }
        match (target.existing, target.host_path()) {
            (Some(_), Some(host_path)) => Ok(!self.host.access_writable(&host_path)?),
            _ => Ok(false),
        }
    }

    /// Drive label of the mount holding `path`, `None` if nothing does.
    pub fn get_drive(&self, path: &str) -> FsResult<Option<String>> {
        let path = GuestPath::parse(path)?;
        Ok(match self.lookup(&path)? {
            Some(Lookup::Found(found)) => Some(found.mount.drive()),
            _ => None,
        })
    }

    /// File size in bytes; directories are 0.
    pub fn get_size(&self, raw: &str) -> FsResult<u64> {
        let path = GuestPath::parse(raw)?;
        match self.lookup(&path)? {
            Some(Lookup::Found(found)) => self.size_of(&found, &path),
            Some(Lookup::Virtual) => Ok(0),
            None => Err(FsError::not_found(path.to_string())),
        }
    }

    fn size_of(&self, found: &Resolved<'_>, path: &GuestPath) -> FsResult<u64> {
        if found.kind.is_dir() {
            return Ok(0);
        }
        match found.mount.backend() {
            Backend::Host { root } => {
                let stat = self
                    .host
                    .stat(&join_host(root, &found.rest))
                    .map_err(|e| FsError::from_host(e, path.to_string()))?;
                Ok(stat.size)
            }
            Backend::Archive(archive) => {
                let entry = archive
                    .traverse(&found.rest)
                    .map_err(|e| FsError::from_archive(e, path.to_string()))?;
                Ok(u64::from(entry.size()))
            }
        }
    }

    /// Bytes the guest may still write below `path`. 0 on read-only mounts.
    pub fn get_free_space(&self, raw: &str) -> FsResult<u64> {
        let path = GuestPath::parse(raw)?;
        if matches!(self.lookup(&path)?, Some(Lookup::Virtual)) {
            return Ok(0);
        }
        let target = self.resolver().nearest(&path)?;
        if target.mount.is_read_only() {
            return Ok(0);
        }
        match target.existing_host_path() {
            Some(host_path) => Ok(self.host.statvfs(&host_path)?.available_bytes()),
            None => Ok(0),
        }
    }

    /// Total size of the volume behind `path`, `None` for archives and mount
    /// directories.
    pub fn get_capacity(&self, raw: &str) -> FsResult<Option<u64>> {
        let path = GuestPath::parse(raw)?;
        if matches!(self.lookup(&path)?, Some(Lookup::Virtual)) {
            return Ok(None);
        }
        let target = self.resolver().nearest(&path)?;
        match target.existing_host_path() {
            Some(host_path) => Ok(Some(self.host.statvfs(&host_path)?.capacity_bytes())),
            None => Ok(None),
        }
    }

    pub fn attributes(&self, raw: &str) -> FsResult<FileAttributes> {
        let path = GuestPath::parse(raw)?;
        let found = match self.lookup(&path)? {
            Some(Lookup::Found(found)) => found,
            Some(Lookup::Virtual) => {
                return Ok(FileAttributes {
                    size: 0,
                    is_dir: true,
                    is_read_only: true,
                    modified: 0,
                    created: 0,
                });
            }
            None => return Err(FsError::not_found(path.to_string())),
        };

        let (modified, created) = match found.host_path() {
            Some(host_path) => {
                let stat = self
                    .host
                    .stat(&host_path)
                    .map_err(|e| FsError::from_host(e, path.to_string()))?;
                (epoch_millis(stat.modified), epoch_millis(stat.created))
            }
            None => (0, 0),
        };
        Ok(FileAttributes {
            size: self.size_of(&found, &path)?,
            is_dir: found.kind.is_dir(),
            is_read_only: self.is_read_only(raw)?,
            modified,
            created,
        })
    }

    /// Names in the directory at `path`, merged across every mount holding
    /// it plus the mount points directly below, sorted and de-duplicated.
    pub fn list(&self, raw: &str) -> FsResult<Vec<String>> {
        let path = GuestPath::parse(raw)?;
        let found = self.resolver().resolve_all(&path)?;
        let mut names: BTreeSet<String> = self.mounts.children_below(&path);
        let mut is_dir = !names.is_empty() || self.is_virtual_dir(&path);
        let mut is_file = false;

        for entry in &found {
            match entry.kind {
                NodeKind::File => is_file = true,
                NodeKind::Dir => {
                    is_dir = true;
                    names.extend(self.read_dir_names(entry, &path)?);
                }
            }
        }

        if !is_dir {
            return Err(if is_file {
                FsError::not_a_directory(path.to_string())
            } else {
                FsError::not_found(path.to_string())
            });
        }
        tracing::trace!(path = %path, mounts = found.len(), entries = names.len(), "listed");
        Ok(names.into_iter().collect())
    }

    fn read_dir_names(&self, found: &Resolved<'_>, path: &GuestPath) -> FsResult<Vec<String>> {
        match found.mount.backend() {
            Backend::Host { root } => {
                let names = self
                    .host
                    .read_dir(&join_host(root, &found.rest))
                    .map_err(|e| FsError::from_host(e, path.to_string()))?;
                Ok(names
                    .into_iter()
                    .filter(|name| !self.config.is_ignored(name))
                    .collect())
            }
            Backend::Archive(archive) => {
                let entry = archive
                    .traverse(&found.rest)
                    .map_err(|e| FsError::from_archive(e, path.to_string()))?;
                Ok(archive.read_dir(&entry)?.names()?)
            }
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Create a directory and any missing parents. An existing directory is
    /// left alone.
    pub fn make_dir(&self, raw: &str) -> FsResult<()> {
        let path = GuestPath::parse(raw)?;
        match self.lookup(&path)? {
            Some(Lookup::Found(found)) if found.kind.is_dir() => return Ok(()),
            Some(Lookup::Found(_)) => return Err(FsError::already_exists(path.to_string())),
            Some(Lookup::Virtual) => return Ok(()),
            None => {}
        }
        let target = self.resolver().resolve_for_write(&path, true)?;
        let host_path = target
            .host_path()
            .ok_or_else(|| FsError::permission_denied(path.to_string()))?;
        self.host
            .mkdir(&host_path)
            .map_err(|e| FsError::from_host(e, path.to_string()))?;
        tracing::debug!(path = %path, "made directory");
        Ok(())
    }

    /// Remove a file or a directory tree. A missing path is not an error.
    pub fn delete(&self, raw: &str) -> FsResult<()> {
        let path = GuestPath::parse(raw)?;
        let found = match self.lookup(&path)? {
            Some(Lookup::Found(found)) => found,
            Some(Lookup::Virtual) => return Err(FsError::permission_denied(path.to_string())),
            None => return Ok(()),
        };
        if found.is_mount_root() || found.mount.is_read_only() {
            return Err(FsError::permission_denied(path.to_string()));
        }
        self.remove_tree(&found, &path)?;
        tracing::debug!(path = %path, "deleted");
        Ok(())
    }

    /// Copy a file or directory tree. Archive sources are allowed.
    pub fn copy(&self, from: &str, to: &str) -> FsResult<()> {
        let (src, to_path, dst) = self.plan_transfer(from, to, false)?;
        self.resolver().create_parents(&dst, &to_path)?;
        self.copy_tree(&src, &dst, &to_path)?;
        tracing::debug!(from, to = %to_path, "copied");
        Ok(())
    }

    /// Move a file or directory tree. Within one mount this is a host
    /// rename; across mounts it is a copy followed by a delete.
    pub fn move_path(&self, from: &str, to: &str) -> FsResult<()> {
        let from_path = GuestPath::parse(from)?;
        let (src, to_path, dst) = self.plan_transfer(from, to, true)?;
        self.resolver().create_parents(&dst, &to_path)?;

        if src.mount.id() == dst.mount.id() {
            if let (Some(src_host), Some(dst_host)) = (src.host_path(), dst.host_path()) {
                self.host
                    .rename(&src_host, &dst_host)
                    .map_err(|e| FsError::from_host(e, to_path.to_string()))?;
                tracing::debug!(from = %from_path, to = %to_path, "renamed");
                return Ok(());
            }
        }

        tracing::debug!(from = %from_path, to = %to_path, "moving across mounts");
        self.copy_tree(&src, &dst, &to_path)?;
        self.remove_tree(&src, &from_path)
    }

    /// Every check for copy and move, run before anything is touched.
    fn plan_transfer(
        &self,
        from: &str,
        to: &str,
        is_move: bool,
    ) -> FsResult<(Resolved<'_>, GuestPath, WriteTarget<'_>)> {
        let from_path = GuestPath::parse(from)?;
        let to_path = GuestPath::parse(to)?;

        let src = match self.lookup(&from_path)? {
            Some(Lookup::Found(found)) => found,
            Some(Lookup::Virtual) => return Err(FsError::permission_denied(from_path.to_string())),
            None => return Err(FsError::not_found(from_path.to_string())),
        };
        if is_move && src.mount.is_read_only() {
            return Err(FsError::permission_denied(from_path.to_string()));
        }

        let to_is_mount = self.is_virtual_dir(&to_path);
        let dst = if to_is_mount {
            None
        } else {
            Some(self.resolver().nearest(&to_path)?)
        };
        if dst.as_ref().is_some_and(|d| d.mount.is_read_only()) {
            return Err(FsError::permission_denied(to_path.to_string()));
        }

        if to_path.len() > from_path.len() && to_path.starts_with(&from_path) {
            return Err(FsError::invalid_path(to_path.to_string()));
        }
        if let (Some(src_host), Some(dst_host)) =
            (src.host_path(), dst.as_ref().and_then(WriteTarget::host_path))
        {
            if dst_host != src_host && dst_host.starts_with(&src_host) {
                return Err(FsError::invalid_path(to_path.to_string()));
            }
        }

        if src.is_mount_root() {
            return Err(FsError::permission_denied(from_path.to_string()));
        }
        let Some(dst) = dst else {
            return Err(FsError::permission_denied(to_path.to_string()));
        };
        if dst.existing.is_some() {
            return Err(FsError::already_exists(to_path.to_string()));
        }
        Ok((src, to_path, dst))
    }

    fn copy_tree(&self, src: &Resolved<'_>, dst: &WriteTarget<'_>, to_path: &GuestPath) -> FsResult<()> {
        let dst_root = dst
            .host_path()
            .ok_or_else(|| FsError::permission_denied(to_path.to_string()))?;
        let tree = MountTree::new(src.mount, self.host.as_ref(), &src.rest);
        let mut buf = vec![0u8; self.config.copy_buffer_size.max(1)];

        for step in Walker::new(&tree) {
            match step? {
                WalkEntry::EnterDir(rel) => {
                    self.host
                        .mkdir(&join_host(&dst_root, &rel))
                        .map_err(|e| FsError::from_host(e, to_path.to_string()))?;
                }
                WalkEntry::File(rel) => {
                    let from: Vec<String> = src.rest.iter().chain(&rel).cloned().collect();
                    self.copy_file(src.mount, &from, &join_host(&dst_root, &rel), &mut buf, to_path)?;
                }
                WalkEntry::LeaveDir(_) => {}
            }
        }
        Ok(())
    }

    fn copy_file(
        &self,
        mount: &Mount,
        rest: &[String],
        dst: &Path,
        buf: &mut [u8],
        to_path: &GuestPath,
    ) -> FsResult<()> {
        let src_path: Vec<String> = mount.point().segments().iter().chain(rest).cloned().collect();
        let src_path = GuestPath::from(src_path);
        let mut reader: Box<dyn Read> = match self.open_stream(mount, rest, OpenMode::READ, &src_path)? {
            Stream::Host(file) => Box::new(file),
            Stream::Archive(slice) => Box::new(slice),
        };
        let mut writer = self
            .host
            .open(dst, OpenMode::WRITE)
            .map_err(|e| FsError::from_host(e, to_path.to_string()))?;
        loop {
            let n = reader.read(buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Remove children before their directory.
    fn remove_tree(&self, found: &Resolved<'_>, path: &GuestPath) -> FsResult<()> {
        let root = found
            .host_path()
            .ok_or_else(|| FsError::permission_denied(path.to_string()))?;
        let tree = MountTree::new(found.mount, self.host.as_ref(), &found.rest);
        for step in Walker::new(&tree) {
            match step? {
                WalkEntry::File(rel) | WalkEntry::LeaveDir(rel) => {
                    self.host
                        .remove(&join_host(&root, &rel))
                        .map_err(|e| FsError::from_host(e, path.to_string()))?;
                }
                WalkEntry::EnterDir(_) => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Open a file. `mode` is `r`, `w` or `a`, optionally followed by `+`,
    /// `b` or `+b`.
    pub fn open(&self, raw: &str, mode: &str) -> FsResult<FileHandle> {
        let mode: OpenMode = mode.parse()?;
        let slot = OpenFileSlot::acquire(&self.open_files, self.config.max_open_files).ok_or_else(|| {
            tracing::warn!(limit = self.config.max_open_files, "open file limit reached");
            FsError::TooManyOpenFiles(raw.trim_start_matches('/').to_string())
        })?;
        let path = GuestPath::parse(raw)?;

        let stream = if mode.creates() {
            match self.lookup(&path)? {
                Some(Lookup::Virtual) => return Err(FsError::permission_denied(path.to_string())),
                Some(Lookup::Found(found)) => {
                    if found.mount.is_read_only() {
                        return Err(FsError::permission_denied(path.to_string()));
                    }
                    if found.kind.is_dir() {
                        return Err(FsError::CannotWriteToDirectory(path.to_string()));
                    }
                    self.open_stream(found.mount, &found.rest, mode, &path)?
                }
                None => {
                    let target = self.resolver().resolve_for_write(&path, true)?;
                    self.open_stream(target.mount, &target.rest, mode, &path)?
                }
            }
        } else {
            let found = match self.lookup(&path)? {
                Some(Lookup::Found(found)) => found,
                Some(Lookup::Virtual) => return Err(FsError::NotAFile(path.to_string())),
                None => return Err(FsError::not_found(path.to_string())),
            };
            if found.kind.is_dir() {
                return Err(FsError::NotAFile(path.to_string()));
            }
            if mode.can_write() && found.mount.is_read_only() {
                return Err(FsError::permission_denied(path.to_string()));
            }
            self.open_stream(found.mount, &found.rest, mode, &path)?
        };

        tracing::trace!(path = %path, %mode, "opened file");
        Ok(FileHandle::new(path, mode, stream, slot))
    }

    fn open_stream(&self, mount: &Mount, rest: &[String], mode: OpenMode, path: &GuestPath) -> FsResult<Stream> {
        match mount.backend() {
            Backend::Host { root } => self
                .host
                .open(&join_host(root, rest), mode)
                .map(Stream::Host)
                .map_err(|e| FsError::from_host(e, path.to_string())),
            Backend::Archive(archive) => {
                let entry = archive
                    .traverse(rest)
                    .map_err(|e| FsError::from_archive(e, path.to_string()))?;
                if entry.is_dir() {
                    return Err(FsError::NotAFile(path.to_string()));
                }
                Ok(Stream::Archive(archive.open(&entry)?))
            }
        }
    }
}

fn epoch_millis(time: Option<SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
