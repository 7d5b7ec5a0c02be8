//! Iterative tree walking for recursive copy and delete.
//!
//! [`Walker`] keeps its own stack instead of recursing, so a walk can be
//! paused between entries and picked up again, and deep trees cannot blow
//! the call stack. Directories are reported on the way in
//! ([`WalkEntry::EnterDir`]) and on the way out ([`WalkEntry::LeaveDir`]):
//! copy creates on enter, delete removes on leave.

use std::path::PathBuf;
use std::vec;

use guestfs_mmfs::Archive;

use crate::error::{FsError, FsResult};
use crate::host::HostIo;
use crate::mount::{Backend, Mount, join_host};

/// A read-only view of a directory tree, addressed by segments relative to
/// the walk root.
pub trait TreeSource {
    /// Whether `rel` is a directory. Errors if it does not exist.
    fn is_dir(&self, rel: &[String]) -> FsResult<bool>;

    /// Child names of the directory at `rel`.
    fn children(&self, rel: &[String]) -> FsResult<Vec<String>>;
}

/// One step of a walk. Paths are relative to the walk root; the root itself
/// is the empty path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    EnterDir(Vec<String>),
    File(Vec<String>),
    LeaveDir(Vec<String>),
}

impl WalkEntry {
    pub fn rel(&self) -> &[String] {
        match self {
            WalkEntry::EnterDir(rel) | WalkEntry::File(rel) | WalkEntry::LeaveDir(rel) => rel,
        }
    }
}

#[derive(Debug)]
struct Frame {
    rel: Vec<String>,
    children: vec::IntoIter<String>,
}

/// Depth-first walk over a [`TreeSource`]. Children are visited in sorted
/// order.
pub struct Walker<'s, S: TreeSource + ?Sized> {
    source: &'s S,
    stack: Vec<Frame>,
    started: bool,
}

impl<'s, S: TreeSource + ?Sized> Walker<'s, S> {
    pub fn new(source: &'s S) -> Self {
        Self {
            source,
            stack: Vec::new(),
            started: false,
        }
    }

    /// Current depth below the walk root.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn enter(&mut self, rel: Vec<String>) -> FsResult<WalkEntry> {
        let mut children = self.source.children(&rel)?;
        children.sort();
        self.stack.push(Frame {
            rel: rel.clone(),
            children: children.into_iter(),
        });
        Ok(WalkEntry::EnterDir(rel))
    }

    fn step(&mut self) -> FsResult<Option<WalkEntry>> {
        if !self.started {
            self.started = true;
            if !self.source.is_dir(&[])? {
                return Ok(Some(WalkEntry::File(Vec::new())));
            }
            return self.enter(Vec::new()).map(Some);
        }

        let Some(frame) = self.stack.last_mut() else {
            return Ok(None);
        };
        match frame.children.next() {
            Some(name) => {
                let mut rel = frame.rel.clone();
                rel.push(name);
                if self.source.is_dir(&rel)? {
                    self.enter(rel).map(Some)
                } else {
                    Ok(Some(WalkEntry::File(rel)))
                }
            }
            None => {
                let done = self.stack.pop().map(|f| f.rel).unwrap_or_default();
                Ok(Some(WalkEntry::LeaveDir(done)))
            }
        }
    }
}

impl<S: TreeSource + ?Sized> Iterator for Walker<'_, S> {
    type Item = FsResult<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                // Stop after the first error.
                self.stack.clear();
                self.started = true;
                Some(Err(e))
            }
        }
    }
}

/// The subtree of one mount below `base`, as a [`TreeSource`].
pub enum MountTree<'a> {
    Host {
        host: &'a dyn HostIo,
        root: PathBuf,
    },
    Archive {
        archive: &'a Archive,
        base: Vec<String>,
    },
}

impl<'a> MountTree<'a> {
    pub fn new(mount: &'a Mount, host: &'a dyn HostIo, base: &[String]) -> Self {
        match mount.backend() {
            Backend::Host { root } => MountTree::Host {
                host,
                root: join_host(root, base),
            },
            Backend::Archive(archive) => MountTree::Archive {
                archive,
                base: base.to_vec(),
            },
        }
    }

    fn archive_path(base: &[String], rel: &[String]) -> Vec<String> {
        base.iter().chain(rel).cloned().collect()
    }
}

impl TreeSource for MountTree<'_> {
    fn is_dir(&self, rel: &[String]) -> FsResult<bool> {
        match self {
            MountTree::Host { host, root } => {
                let path = join_host(root, rel);
                host.stat(&path)
                    .map(|s| s.is_dir)
                    .map_err(|e| FsError::from_host(e, path.display().to_string()))
            }
            MountTree::Archive { archive, base } => {
                let segments = Self::archive_path(base, rel);
                archive
                    .traverse(&segments)
                    .map(|e| e.is_dir())
                    .map_err(|e| FsError::from_archive(e, segments.join("/")))
            }
        }
    }

    fn children(&self, rel: &[String]) -> FsResult<Vec<String>> {
        match self {
            MountTree::Host { host, root } => {
                let path = join_host(root, rel);
                host.read_dir(&path)
                    .map_err(|e| FsError::from_host(e, path.display().to_string()))
            }
            MountTree::Archive { archive, base } => {
                let segments = Self::archive_path(base, rel);
                let entry = archive
                    .traverse(&segments)
                    .map_err(|e| FsError::from_archive(e, segments.join("/")))?;
                Ok(archive.read_dir(&entry)?.names()?)
            }
        }
    }
}
