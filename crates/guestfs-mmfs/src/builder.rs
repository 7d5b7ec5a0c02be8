//! Packing trees into mmfs images.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{MmfsError, MmfsResult};
use crate::format::{ENTRY_SIZE, MAGIC, MAX_FILE_SIZE, MAX_NAME_LEN, NAME_FIELD_LEN, pack_flags};

#[derive(Debug)]
enum Node {
    File(Vec<u8>),
    // BTreeMap<String, _> iterates in byte-wise order, which is the order
    // lookups binary-search in.
    Dir(BTreeMap<String, Node>),
}

/// Builds an mmfs image from files and directories added in any order.
///
/// ```
/// use guestfs_mmfs::{Archive, ArchiveBuilder};
///
/// let mut builder = ArchiveBuilder::new();
/// builder.add_file("startup.lua", b"print('hi')".to_vec()).unwrap();
/// let archive = Archive::from_bytes(builder.build().unwrap()).unwrap();
/// assert!(archive.traverse(&["startup.lua"]).is_ok());
/// ```
#[derive(Debug)]
pub struct ArchiveBuilder {
    root: BTreeMap<String, Node>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
        }
    }

    /// Create a builder holding a copy of a host directory tree.
    pub fn from_host_dir(dir: impl AsRef<Path>) -> MmfsResult<Self> {
        let mut builder = Self::new();
        builder.add_host_dir("", dir)?;
        Ok(builder)
    }

    /// Add a file at a `/`-separated path, creating parent directories.
    pub fn add_file(&mut self, path: &str, data: impl Into<Vec<u8>>) -> MmfsResult<&mut Self> {
        let data = data.into();
        let (parents, name) = split(path)?;
        if data.len() > MAX_FILE_SIZE {
            return Err(MmfsError::FileTooLarge {
                name: path.to_string(),
                size: data.len(),
            });
        }
        let dir = self.dir_mut(&parents, path)?;
        if dir.contains_key(name) {
            return Err(MmfsError::AlreadyExists(path.to_string()));
        }
        dir.insert(name.to_string(), Node::File(data));
        Ok(self)
    }

    /// Add a directory (and its parents). Adding an existing directory is a no-op.
    pub fn add_dir(&mut self, path: &str) -> MmfsResult<&mut Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.dir_mut(&segments, path)?;
        Ok(self)
    }

    /// Recursively copy a host directory's contents under `prefix`.
    pub fn add_host_dir(&mut self, prefix: &str, dir: impl AsRef<Path>) -> MmfsResult<&mut Self> {
        let dir = dir.as_ref();
        self.add_dir(prefix)?;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix.trim_end_matches('/'), name)
            };
            if entry.file_type()?.is_dir() {
                self.add_host_dir(&path, entry.path())?;
            } else {
                tracing::debug!(%path, "packing file");
                self.add_file(&path, fs::read(entry.path())?)?;
            }
        }
        Ok(self)
    }

    /// Serialize the tree. The root directory lands at offset 0.
    pub fn build(&self) -> MmfsResult<Vec<u8>> {
        let mut out = Vec::new();
        write_dir(&mut out, &self.root)?;
        if u32::try_from(out.len()).is_err() {
            return Err(MmfsError::ImageTooLarge);
        }
        tracing::debug!(bytes = out.len(), "built mmfs image");
        Ok(out)
    }

    fn dir_mut(&mut self, segments: &[&str], path: &str) -> MmfsResult<&mut BTreeMap<String, Node>> {
        let mut dir = &mut self.root;
        for segment in segments {
            check_name(segment)?;
            let node = dir
                .entry(segment.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            dir = match node {
                Node::Dir(children) => children,
                Node::File(_) => return Err(MmfsError::not_a_directory(path)),
            };
        }
        Ok(dir)
    }
}

fn split(path: &str) -> MmfsResult<(Vec<&str>, &str)> {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let name = segments.pop().ok_or_else(|| MmfsError::invalid_name(path))?;
    check_name(name)?;
    Ok((segments, name))
}

fn check_name(name: &str) -> MmfsResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > MAX_NAME_LEN
        || name.contains(['/', '\\', '\0'])
    {
        return Err(MmfsError::invalid_name(name));
    }
    Ok(())
}

fn offset_of(out: &[u8]) -> MmfsResult<u32> {
    u32::try_from(out.len()).map_err(|_| MmfsError::ImageTooLarge)
}

fn write_dir(out: &mut Vec<u8>, children: &BTreeMap<String, Node>) -> MmfsResult<()> {
    let count = u32::try_from(children.len()).map_err(|_| MmfsError::ImageTooLarge)?;
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    let table = out.len();
    out.resize(table + children.len() * ENTRY_SIZE, 0);

    for (index, (name, node)) in children.iter().enumerate() {
        let offset = offset_of(out)?;
        let (is_dir, size) = match node {
            Node::File(data) => {
                out.extend_from_slice(data);
                // Checked against MAX_FILE_SIZE on insert.
                (false, data.len() as u32)
            }
            Node::Dir(grandchildren) => {
                write_dir(out, grandchildren)?;
                (true, 0)
            }
        };

        let record = &mut out[table + index * ENTRY_SIZE..table + (index + 1) * ENTRY_SIZE];
        record[..name.len()].copy_from_slice(name.as_bytes());
        record[NAME_FIELD_LEN..NAME_FIELD_LEN + 4]
            .copy_from_slice(&pack_flags(is_dir, size).to_le_bytes());
        record[NAME_FIELD_LEN + 4..].copy_from_slice(&offset.to_le_bytes());
    }
    Ok(())
}
