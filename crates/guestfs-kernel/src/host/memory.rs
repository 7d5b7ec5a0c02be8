//! In-memory host I/O.
//!
//! A tmpfs-style tree for tests and diskless machines. All data is lost when
//! dropped.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use super::{HostFile, HostIo, HostStat, HostStatVfs};
use crate::mode::OpenMode;

const BLOCK_SIZE: u64 = 4096;

#[derive(Debug)]
struct FileData {
    bytes: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Arc<RwLock<FileData>>,
        created: SystemTime,
    },
    Directory {
        created: SystemTime,
    },
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<PathBuf, Node>,
    read_only: HashSet<PathBuf>,
}

/// In-memory host I/O.
///
/// Thread-safe via an internal `RwLock`. Open files share their buffer with
/// the tree, so writes are visible to later opens without a flush.
#[derive(Debug)]
pub struct MemoryHostIo {
    tree: RwLock<Tree>,
    capacity: u64,
}

impl Default for MemoryHostIo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHostIo {
    /// Create an empty tree holding only `/`, with a 4 GiB nominal volume.
    pub fn new() -> Self {
        Self::with_capacity(1024 * 1024 * BLOCK_SIZE)
    }

    /// Create an empty tree reporting `capacity` bytes in `statvfs`.
    pub fn with_capacity(capacity: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            PathBuf::new(),
            Node::Directory {
                created: SystemTime::now(),
            },
        );
        Self {
            tree: RwLock::new(Tree {
                nodes,
                read_only: HashSet::new(),
            }),
            capacity,
        }
    }

    /// Drop the root, `.` and `..` components; keys are relative to `/`.
    fn normalize(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(s) => result.push(s),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        result
    }

    /// Create a directory and any missing parents.
    pub fn create_dir_all(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = Self::normalize(path.as_ref());
        let mut tree = self.tree.write();
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            match tree.nodes.get(&current) {
                Some(Node::Directory { .. }) => continue,
                Some(Node::File { .. }) => return Err(not_a_directory(&current)),
                None => {}
            }
            tree.nodes.insert(
                current.clone(),
                Node::Directory {
                    created: SystemTime::now(),
                },
            );
        }
        Ok(())
    }

    /// Write a whole file, creating missing parents.
    pub fn write_file(&self, path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) -> io::Result<()> {
        let path = Self::normalize(path.as_ref());
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        let bytes: Vec<u8> = bytes.into();
        let mut file = self.open(&path, OpenMode::WRITE)?;
        file.write_all(&bytes)
    }

    /// Read a whole file.
    pub fn read_file(&self, path: impl AsRef<Path>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.open(path.as_ref(), OpenMode::READ)?
            .read_to_end(&mut out)?;
        Ok(out)
    }

    /// Mark a path as not writable for [`HostIo::access_writable`].
    pub fn set_read_only(&self, path: impl AsRef<Path>, read_only: bool) {
        let path = Self::normalize(path.as_ref());
        let mut tree = self.tree.write();
        if read_only {
            tree.read_only.insert(path);
        } else {
            tree.read_only.remove(&path);
        }
    }

    fn used_bytes(&self) -> u64 {
        let tree = self.tree.read();
        tree.nodes
            .values()
            .map(|node| match node {
                Node::File { data, .. } => data.read().bytes.len() as u64,
                Node::Directory { .. } => 0,
            })
            .sum()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("/{}", path.display()))
}

fn not_a_directory(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotADirectory, format!("/{}", path.display()))
}

fn is_a_directory(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::IsADirectory, format!("/{}", path.display()))
}

impl Tree {
    fn require_parent_dir(&self, path: &Path) -> io::Result<()> {
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        match self.nodes.get(parent) {
            Some(Node::Directory { .. }) => Ok(()),
            Some(Node::File { .. }) => Err(not_a_directory(parent)),
            None => Err(not_found(parent)),
        }
    }
}

impl HostIo for MemoryHostIo {
    fn stat(&self, path: &Path) -> io::Result<HostStat> {
        let path = Self::normalize(path);
        let tree = self.tree.read();
        match tree.nodes.get(&path) {
            Some(Node::File { data, created }) => {
                let data = data.read();
                Ok(HostStat {
                    is_dir: false,
                    size: data.bytes.len() as u64,
                    modified: Some(data.modified),
                    created: Some(*created),
                })
            }
            Some(Node::Directory { created }) => Ok(HostStat {
                is_dir: true,
                size: 0,
                modified: Some(*created),
                created: Some(*created),
            }),
            None => Err(not_found(&path)),
        }
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        let path = Self::normalize(path);
        let mut tree = self.tree.write();
        if tree.nodes.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("/{}", path.display()),
            ));
        }
        tree.require_parent_dir(&path)?;
        tree.nodes.insert(
            path,
            Node::Directory {
                created: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let path = Self::normalize(path);
        let tree = self.tree.read();
        match tree.nodes.get(&path) {
            Some(Node::Directory { .. }) => {}
            Some(Node::File { .. }) => return Err(not_a_directory(&path)),
            None => return Err(not_found(&path)),
        }
        Ok(tree
            .nodes
            .keys()
            .filter(|key| key.parent() == Some(path.as_path()))
            .filter_map(|key| key.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn HostFile>> {
        let path = Self::normalize(path);
        let mut tree = self.tree.write();
        let data = match tree.nodes.get(&path).cloned() {
            Some(Node::Directory { .. }) => return Err(is_a_directory(&path)),
            Some(Node::File { data, .. }) => {
                if mode.truncates() {
                    let mut file = data.write();
                    file.bytes.clear();
                    file.modified = SystemTime::now();
                }
                data
            }
            None if mode.creates() => {
                tree.require_parent_dir(&path)?;
                let now = SystemTime::now();
                let data = Arc::new(RwLock::new(FileData {
                    bytes: Vec::new(),
                    modified: now,
                }));
                tree.nodes.insert(
                    path,
                    Node::File {
                        data: Arc::clone(&data),
                        created: now,
                    },
                );
                data
            }
            None => return Err(not_found(&path)),
        };
        Ok(Box::new(MemoryFile {
            data,
            pos: 0,
            mode,
        }))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let path = Self::normalize(path);
        let mut tree = self.tree.write();
        match tree.nodes.get(&path) {
            None => return Err(not_found(&path)),
            Some(Node::Directory { .. }) => {
                if path.as_os_str().is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "cannot remove /",
                    ));
                }
                let has_children = tree.nodes.keys().any(|k| k.parent() == Some(path.as_path()));
                if has_children {
                    return Err(io::Error::new(
                        io::ErrorKind::DirectoryNotEmpty,
                        format!("/{}", path.display()),
                    ));
                }
            }
            Some(Node::File { .. }) => {}
        }
        tree.nodes.remove(&path);
        tree.read_only.remove(&path);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let from = Self::normalize(from);
        let to = Self::normalize(to);
        let mut tree = self.tree.write();
        if !tree.nodes.contains_key(&from) {
            return Err(not_found(&from));
        }
        if to.starts_with(&from) && to != from {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot move a directory into itself",
            ));
        }
        tree.require_parent_dir(&to)?;

        let moved: Vec<PathBuf> = tree
            .nodes
            .keys()
            .filter(|k| k.starts_with(&from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = tree.nodes.remove(&old) {
                let suffix = old.strip_prefix(&from).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() {
                    to.clone()
                } else {
                    to.join(suffix)
                };
                tree.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn statvfs(&self, path: &Path) -> io::Result<HostStatVfs> {
        self.stat(path)?;
        let free = self.capacity.saturating_sub(self.used_bytes());
        Ok(HostStatVfs {
            blocks: self.capacity / BLOCK_SIZE,
            bavail: free / BLOCK_SIZE,
            bsize: BLOCK_SIZE,
        })
    }

    fn access_writable(&self, path: &Path) -> io::Result<bool> {
        let path = Self::normalize(path);
        let tree = self.tree.read();
        if !tree.nodes.contains_key(&path) {
            return Err(not_found(&path));
        }
        Ok(!tree.read_only.contains(&path))
    }
}

/// An open in-memory file. Shares its buffer with the tree.
#[derive(Debug)]
struct MemoryFile {
    data: Arc<RwLock<FileData>>,
    pos: u64,
    mode: OpenMode,
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.mode.can_read() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "not open for reading"));
        }
        let data = self.data.read();
        let start = (self.pos as usize).min(data.bytes.len());
        let n = (data.bytes.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data.bytes[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.mode.can_write() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "not open for writing"));
        }
        let mut data = self.data.write();
        if self.mode.appends() {
            self.pos = data.bytes.len() as u64;
        }
        let start = self.pos as usize;
        let end = start + buf.len();
        if data.bytes.len() < end {
            data.bytes.resize(end, 0);
        }
        data.bytes[start..end].copy_from_slice(buf);
        data.modified = SystemTime::now();
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.read().bytes.len() as i128;
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => len + d as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_back() {
        let host = MemoryHostIo::new();
        host.write_file("/a/b/c.txt", b"hello".to_vec()).unwrap();
        assert_eq!(host.read_file("/a/b/c.txt").unwrap(), b"hello");
        assert!(host.stat(Path::new("/a/b")).unwrap().is_dir);
        assert_eq!(host.stat(Path::new("/a/b/c.txt")).unwrap().size, 5);
    }

    #[test]
    fn test_open_requires_parent() {
        let host = MemoryHostIo::new();
        let err = host.open(Path::new("/missing/f"), OpenMode::WRITE).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        let err = host.open(Path::new("/f"), OpenMode::READ).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_open_directory_fails() {
        let host = MemoryHostIo::new();
        host.create_dir_all("/d").unwrap();
        let err = host.open(Path::new("/d"), OpenMode::READ).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::IsADirectory);
    }

    #[test]
    fn test_append_mode_ignores_seek() {
        let host = MemoryHostIo::new();
        host.write_file("/log", b"ab".to_vec()).unwrap();
        let mut f = host.open(Path::new("/log"), OpenMode::APPEND).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(b"cd").unwrap();
        assert_eq!(host.read_file("/log").unwrap(), b"abcd");
    }

    #[test]
    fn test_overwrite_in_place() {
        let host = MemoryHostIo::new();
        host.write_file("/f", b"hello".to_vec()).unwrap();
        let mut f = host.open(Path::new("/f"), OpenMode::READ.with_plus()).unwrap();
        f.seek(SeekFrom::Start(1)).unwrap();
        f.write_all(b"EL").unwrap();
        assert_eq!(host.read_file("/f").unwrap(), b"hELlo");
    }

    #[test]
    fn test_read_dir_lists_direct_children() {
        let host = MemoryHostIo::new();
        host.write_file("/d/x", Vec::new()).unwrap();
        host.write_file("/d/sub/y", Vec::new()).unwrap();
        let mut names = host.read_dir(Path::new("/d")).unwrap();
        names.sort();
        assert_eq!(names, vec!["sub", "x"]);
    }

    #[test]
    fn test_remove() {
        let host = MemoryHostIo::new();
        host.write_file("/d/x", Vec::new()).unwrap();
        let err = host.remove(Path::new("/d")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::DirectoryNotEmpty);
        host.remove(Path::new("/d/x")).unwrap();
        host.remove(Path::new("/d")).unwrap();
        assert!(host.stat(Path::new("/d")).is_err());
        assert!(host.remove(Path::new("/")).is_err());
    }

    #[test]
    fn test_rename_moves_subtree() {
        let host = MemoryHostIo::new();
        host.write_file("/src/a/b", b"deep".to_vec()).unwrap();
        host.create_dir_all("/dst").unwrap();
        host.rename(Path::new("/src"), Path::new("/dst/moved")).unwrap();
        assert_eq!(host.read_file("/dst/moved/a/b").unwrap(), b"deep");
        assert!(host.stat(Path::new("/src")).is_err());
    }

    #[test]
    fn test_statvfs_tracks_usage() {
        let host = MemoryHostIo::with_capacity(16 * BLOCK_SIZE);
        let before = host.statvfs(Path::new("/")).unwrap();
        assert_eq!(before.available_bytes(), 16 * BLOCK_SIZE);
        host.write_file("/big", vec![0u8; 2 * BLOCK_SIZE as usize]).unwrap();
        let after = host.statvfs(Path::new("/")).unwrap();
        assert_eq!(after.available_bytes(), 14 * BLOCK_SIZE);
        assert_eq!(after.capacity_bytes(), 16 * BLOCK_SIZE);
    }

    #[test]
    fn test_read_only_flag() {
        let host = MemoryHostIo::new();
        host.write_file("/f", Vec::new()).unwrap();
        assert!(host.access_writable(Path::new("/f")).unwrap());
        host.set_read_only("/f", true);
        assert!(!host.access_writable(Path::new("/f")).unwrap());
    }
}
