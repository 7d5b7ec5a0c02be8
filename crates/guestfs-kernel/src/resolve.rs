//! Path resolution against the mount table.
//!
//! Three modes:
//!
//! - **exists** ([`Resolver::resolve_existing`]): the first deepest-prefix
//!   mount, in registration order, whose backend holds the path.
//! - **create-parents** ([`Resolver::resolve_for_write`]): find the deepest
//!   existing directory prefix and optionally create what is missing below
//!   it.
//! - **union** ([`Resolver::resolve_all`]): every deepest-prefix mount that
//!   holds the path.
//!
//! Only the mounts sharing the deepest matching point length are ever
//! considered; a shallower mount never shadows a deeper one.

use std::io;
use std::path::PathBuf;

use guestfs_mmfs::MmfsError;

use crate::error::{FsError, FsResult};
use crate::host::HostIo;
use crate::mount::{Backend, Mount, MountTable};
use crate::path::GuestPath;

/// What a backend holds at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn is_dir(self) -> bool {
        self == NodeKind::Dir
    }
}

/// An existing path on one mount.
#[derive(Debug, Clone)]
pub struct Resolved<'a> {
    pub mount: &'a Mount,
    /// Segments below the mount point.
    pub rest: Vec<String>,
    pub kind: NodeKind,
}

impl Resolved<'_> {
    /// True when the path is the mount point itself.
    pub fn is_mount_root(&self) -> bool {
        self.rest.is_empty()
    }

    pub fn host_path(&self) -> Option<PathBuf> {
        self.mount.host_path(&self.rest)
    }
}

/// A writable destination on one mount, possibly with missing parents.
#[derive(Debug, Clone)]
pub struct WriteTarget<'a> {
    pub mount: &'a Mount,
    /// Segments below the mount point.
    pub rest: Vec<String>,
    /// What already exists at the full path, if anything.
    pub existing: Option<NodeKind>,
    /// How many of `rest` exist as directories on the mount.
    existing_depth: usize,
}

impl WriteTarget<'_> {
    pub fn host_path(&self) -> Option<PathBuf> {
        self.mount.host_path(&self.rest)
    }

    /// Host path of the deepest prefix that already exists.
    pub fn existing_host_path(&self) -> Option<PathBuf> {
        let depth = if self.existing.is_some() {
            self.rest.len()
        } else {
            self.existing_depth
        };
        self.mount.host_path(&self.rest[..depth])
    }

    /// Intermediate directories still to be created.
    pub fn missing_parents(&self) -> usize {
        self.rest.len().saturating_sub(1).saturating_sub(self.existing_depth)
    }
}

/// Resolves guest paths against a mount table, probing backends through a
/// host I/O instance.
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    table: &'a MountTable,
    host: &'a dyn HostIo,
}

impl<'a> Resolver<'a> {
    pub fn new(table: &'a MountTable, host: &'a dyn HostIo) -> Self {
        Self { table, host }
    }

    /// What `mount` holds at `rest`, or `None` if nothing.
    pub fn probe(&self, mount: &Mount, rest: &[String]) -> FsResult<Option<NodeKind>> {
        match mount.backend() {
            Backend::Host { root } => {
                let path = crate::mount::join_host(root, rest);
                match self.host.stat(&path) {
                    Ok(stat) if stat.is_dir => Ok(Some(NodeKind::Dir)),
                    Ok(_) => Ok(Some(NodeKind::File)),
                    Err(e) if is_miss(&e) => Ok(None),
                    Err(e) => Err(FsError::Io(e)),
                }
            }
            Backend::Archive(archive) => match archive.traverse(rest) {
                Ok(entry) if entry.is_dir() => Ok(Some(NodeKind::Dir)),
                Ok(_) => Ok(Some(NodeKind::File)),
                Err(MmfsError::NotFound(_) | MmfsError::NotADirectory(_)) => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Exists mode.
    pub fn resolve_existing(&self, path: &GuestPath) -> FsResult<Resolved<'a>> {
        for mount in self.table.candidates(path) {
            let rest = rest_below(path, mount);
            if let Some(kind) = self.probe(mount, &rest)? {
                tracing::trace!(path = %path, mount = %mount.id(), "resolved");
                return Ok(Resolved { mount, rest, kind });
            }
        }
        Err(FsError::not_found(path.to_string()))
    }

    /// Union mode: every deepest-prefix mount holding `path`, in registration
    /// order. Empty when nothing holds it.
    pub fn resolve_all(&self, path: &GuestPath) -> FsResult<Vec<Resolved<'a>>> {
        let mut found = Vec::new();
        for mount in self.table.candidates(path) {
            let rest = rest_below(path, mount);
            if let Some(kind) = self.probe(mount, &rest)? {
                found.push(Resolved { mount, rest, kind });
            }
        }
        Ok(found)
    }

    /// The mount and existing depth a write to `path` would land on, without
    /// the read-only check. Walks from `path` upward, never above the
    /// candidates' mount point.
    pub fn nearest(&self, path: &GuestPath) -> FsResult<WriteTarget<'a>> {
        let candidates = self.table.candidates(path);
        let Some(first) = candidates.first() else {
            return Err(FsError::not_found(path.to_string()));
        };
        let point_len = first.point().len();

        for &mount in &candidates {
            let rest = rest_below(path, mount);
            if let Some(kind) = self.probe(mount, &rest)? {
                let existing_depth = rest.len();
                return Ok(WriteTarget {
                    mount,
                    rest,
                    existing: Some(kind),
                    existing_depth,
                });
            }
        }

        for depth in (point_len..path.len()).rev() {
            for &mount in &candidates {
                let rest = rest_below(path, mount);
                let existing_depth = depth - point_len;
                match self.probe(mount, &rest[..existing_depth])? {
                    Some(NodeKind::Dir) => {
                        return Ok(WriteTarget {
                            mount,
                            rest,
                            existing: None,
                            existing_depth,
                        });
                    }
                    Some(NodeKind::File) => {
                        return Err(FsError::not_a_directory(path.truncated(depth).to_string()));
                    }
                    None => {}
                }
            }
        }
        Err(FsError::not_found(path.to_string()))
    }

    /// Create-parents mode. Fails [`FsError::PermissionDenied`] on a
    /// read-only or archive mount; with `create`, makes the missing
    /// intermediate directories.
    pub fn resolve_for_write(&self, path: &GuestPath, create: bool) -> FsResult<WriteTarget<'a>> {
        let target = self.nearest(path)?;
        if target.mount.is_read_only() {
            return Err(FsError::permission_denied(path.to_string()));
        }
        if create {
            self.create_parents(&target, path)?;
        }
        Ok(target)
    }

    /// Make the directories between the deepest existing prefix and the
    /// final component.
    pub fn create_parents(&self, target: &WriteTarget<'_>, path: &GuestPath) -> FsResult<()> {
        if target.missing_parents() == 0 {
            return Ok(());
        }
        if target.mount.is_read_only() {
            return Err(FsError::permission_denied(path.to_string()));
        }
        let Backend::Host { root } = target.mount.backend() else {
            return Err(FsError::permission_denied(path.to_string()));
        };
        for depth in target.existing_depth + 1..target.rest.len() {
            let dir = crate::mount::join_host(root, &target.rest[..depth]);
            tracing::debug!(dir = %dir.display(), "creating parent directory");
            match self.host.mkdir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(FsError::from_host(e, path.to_string())),
            }
        }
        Ok(())
    }
}

fn rest_below(path: &GuestPath, mount: &Mount) -> Vec<String> {
    path.strip_prefix(mount.point())
        .map(<[String]>::to_vec)
        .unwrap_or_default()
}

fn is_miss(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHostIo;
    use guestfs_mmfs::{Archive, ArchiveBuilder};
    use std::path::Path;

    fn p(raw: &str) -> GuestPath {
        GuestPath::parse(raw).unwrap()
    }

    fn archive() -> Backend {
        let mut builder = ArchiveBuilder::new();
        builder.add_file("bios.lua", b"boot".to_vec()).unwrap();
        builder.add_dir("apis").unwrap();
        Backend::Archive(Archive::from_bytes(builder.build().unwrap()).unwrap())
    }

    fn setup() -> (MountTable, MemoryHostIo) {
        let host = MemoryHostIo::new();
        host.write_file("/hdd/startup", b"x".to_vec()).unwrap();
        host.create_dir_all("/hdd/rom").unwrap();
        host.create_dir_all("/d1").unwrap();
        host.write_file("/d2/only-in-d2", b"y".to_vec()).unwrap();

        let mut table = MountTable::new(8);
        table.register(p("/"), Backend::Host { root: "/hdd".into() }, false).unwrap();
        table.register(p("/rom"), archive(), false).unwrap();
        table.register(p("/disk"), Backend::Host { root: "/d1".into() }, false).unwrap();
        table.register(p("/disk"), Backend::Host { root: "/d2".into() }, false).unwrap();
        (table, host)
    }

    #[test]
    fn test_existing_prefers_deepest_point() {
        let (table, host) = setup();
        let r = Resolver::new(&table, &host);
        let found = r.resolve_existing(&p("/rom/bios.lua")).unwrap();
        assert!(found.mount.backend().is_archive());
        assert_eq!(found.rest, vec!["bios.lua"]);
        assert_eq!(found.kind, NodeKind::File);

        // The host has a "rom" directory too, but the archive shadows it.
        assert!(r.resolve_existing(&p("/rom/startup")).is_err());
    }

    #[test]
    fn test_existing_probes_ties_in_order() {
        let (table, host) = setup();
        let r = Resolver::new(&table, &host);
        let found = r.resolve_existing(&p("/disk/only-in-d2")).unwrap();
        assert_eq!(found.host_path().unwrap(), Path::new("/d2/only-in-d2"));

        let root = r.resolve_existing(&p("/disk")).unwrap();
        assert_eq!(root.host_path().unwrap(), Path::new("/d1"));
        assert!(root.is_mount_root());
    }

    #[test]
    fn test_existing_missing() {
        let (table, host) = setup();
        let r = Resolver::new(&table, &host);
        assert!(matches!(r.resolve_existing(&p("/nope")), Err(FsError::NotFound(p)) if p == "nope"));
    }

    #[test]
    fn test_union() {
        let (table, host) = setup();
        let r = Resolver::new(&table, &host);
        assert_eq!(r.resolve_all(&p("/disk")).unwrap().len(), 2);
        assert_eq!(r.resolve_all(&p("/disk/only-in-d2")).unwrap().len(), 1);
        assert!(r.resolve_all(&p("/disk/none")).unwrap().is_empty());
    }

    #[test]
    fn test_write_creates_parents() {
        let (table, host) = setup();
        let r = Resolver::new(&table, &host);
        let target = r.resolve_for_write(&p("/a/b/c.txt"), true).unwrap();
        assert_eq!(target.existing, None);
        assert_eq!(target.host_path().unwrap(), Path::new("/hdd/a/b/c.txt"));
        assert!(host.stat(Path::new("/hdd/a/b")).unwrap().is_dir);
        assert!(host.stat(Path::new("/hdd/a/b/c.txt")).is_err());
    }

    #[test]
    fn test_write_without_create_leaves_host_alone() {
        let (table, host) = setup();
        let r = Resolver::new(&table, &host);
        let target = r.resolve_for_write(&p("/a/b/c.txt"), false).unwrap();
        assert_eq!(target.missing_parents(), 2);
        assert!(host.stat(Path::new("/hdd/a")).is_err());
    }

    #[test]
    fn test_write_to_archive_denied() {
        let (table, host) = setup();
        let r = Resolver::new(&table, &host);
        assert!(matches!(
            r.resolve_for_write(&p("/rom/new.lua"), true),
            Err(FsError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_write_under_file_is_not_a_directory() {
        let (table, host) = setup();
        let r = Resolver::new(&table, &host);
        assert!(matches!(
            r.resolve_for_write(&p("/startup/x"), true),
            Err(FsError::NotADirectory(p)) if p == "startup"
        ));
    }

    #[test]
    fn test_write_without_any_mount() {
        let mut table = MountTable::new(8);
        let host = MemoryHostIo::new();
        host.create_dir_all("/r").unwrap();
        table.register(p("/rom"), Backend::Host { root: "/r".into() }, false).unwrap();
        let r = Resolver::new(&table, &host);
        assert!(matches!(r.resolve_for_write(&p("/x"), true), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_write_never_climbs_above_mount_point() {
        let mut table = MountTable::new(8);
        let host = MemoryHostIo::new();
        host.create_dir_all("/hdd").unwrap();
        table.register(p("/"), Backend::Host { root: "/hdd".into() }, false).unwrap();
        // The mount root itself is missing on the host.
        table.register(p("/gone"), Backend::Host { root: "/nowhere".into() }, false).unwrap();
        let r = Resolver::new(&table, &host);
        assert!(matches!(r.resolve_for_write(&p("/gone/x"), true), Err(FsError::NotFound(_))));
    }
}
