//! Bounds-checked views over an mmfs image.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{MmfsError, MmfsResult};
use crate::format::{
    ENTRY_SIZE, HEADER_SIZE, MAGIC, NAME_FIELD_LEN, read_u32, trim_name, unpack_flags,
};
use crate::slice::FileSlice;

/// A decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    name: String,
    is_dir: bool,
    size: u32,
    offset: u32,
}

impl Entry {
    /// The synthetic entry standing for the root directory.
    pub fn root() -> Self {
        Self {
            name: String::new(),
            is_dir: true,
            size: 0,
            offset: 0,
        }
    }

    /// Entry name (empty for the root).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Content size in bytes. Directories report 0.
    pub fn size(&self) -> u32 {
        if self.is_dir { 0 } else { self.size }
    }

    /// Byte offset of the content (or nested directory) from the image base.
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// A validated, shared, immutable mmfs image.
///
/// Cloning is cheap; every clone and every [`FileSlice`] opened from it keep
/// the same buffer alive.
#[derive(Clone)]
pub struct Archive {
    data: Arc<[u8]>,
}

impl fmt::Debug for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("len", &self.data.len())
            .finish()
    }
}

impl Archive {
    /// Wrap an image, checking the root directory header.
    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> MmfsResult<Self> {
        let archive = Self { data: data.into() };
        let root = archive.root()?;
        tracing::debug!(bytes = archive.data.len(), entries = root.len(), "opened mmfs image");
        Ok(archive)
    }

    /// Raw image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for a zero-length image (never the case once validated).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The root directory.
    pub fn root(&self) -> MmfsResult<DirView<'_>> {
        self.dir_at(0)
    }

    /// The directory stored at `offset`.
    pub fn dir_at(&self, offset: u32) -> MmfsResult<DirView<'_>> {
        DirView::new(&self.data, offset as usize)
    }

    /// The directory an entry points at.
    pub fn read_dir(&self, entry: &Entry) -> MmfsResult<DirView<'_>> {
        if !entry.is_dir {
            return Err(MmfsError::not_a_directory(entry.name.clone()));
        }
        self.dir_at(entry.offset)
    }

    /// Walk `segments` from the root, binary-searching each level.
    ///
    /// An empty path yields [`Entry::root`].
    pub fn traverse<S: AsRef<str>>(&self, segments: &[S]) -> MmfsResult<Entry> {
        let mut node = Entry::root();
        for (depth, segment) in segments.iter().enumerate() {
            let segment = segment.as_ref();
            if !node.is_dir {
                return Err(MmfsError::not_a_directory(join(&segments[..depth])));
            }
            let dir = self.dir_at(node.offset)?;
            node = dir
                .find(segment.as_bytes())?
                .ok_or_else(|| MmfsError::not_found(join(&segments[..=depth])))?;
        }
        Ok(node)
    }

    /// Zero-copy view of a file entry's content.
    pub fn data(&self, entry: &Entry) -> MmfsResult<&[u8]> {
        let (start, end) = self.content_range(entry)?;
        Ok(&self.data[start..end])
    }

    /// Open a cursor over a file entry's content.
    pub fn open(&self, entry: &Entry) -> MmfsResult<FileSlice> {
        let (start, end) = self.content_range(entry)?;
        Ok(FileSlice::new(Arc::clone(&self.data), start, end))
    }

    fn content_range(&self, entry: &Entry) -> MmfsResult<(usize, usize)> {
        if entry.is_dir {
            return Err(MmfsError::corrupt(format!("{} is a directory", entry.name)));
        }
        let start = entry.offset as usize;
        let end = start
            .checked_add(entry.size as usize)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                MmfsError::corrupt(format!(
                    "content of {} at {:#x}+{} lies outside the image",
                    entry.name, entry.offset, entry.size
                ))
            })?;
        Ok((start, end))
    }
}

fn join<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("/")
}

/// A directory table whose header and entry array are known to lie inside
/// the image.
///
/// Entries are checked as they are decoded: names must be usable as a single
/// path segment, and a nested directory must lie past the table that lists
/// it, so no chain of directories can loop.
#[derive(Debug, Clone, Copy)]
pub struct DirView<'a> {
    bytes: &'a [u8],
    base: usize,
    table: usize,
    count: usize,
}

impl<'a> DirView<'a> {
    fn new(bytes: &'a [u8], base: usize) -> MmfsResult<Self> {
        let magic = read_u32(bytes, base)
            .ok_or_else(|| MmfsError::corrupt(format!("directory at {base:#x} is past the end")))?;
        if magic != MAGIC {
            return Err(MmfsError::corrupt(format!(
                "bad directory magic {magic:#010x} at {base:#x}"
            )));
        }
        let count = read_u32(bytes, base + 4)
            .ok_or_else(|| MmfsError::corrupt(format!("truncated header at {base:#x}")))?
            as usize;
        let table = base + HEADER_SIZE;
        let fits = count
            .checked_mul(ENTRY_SIZE)
            .and_then(|len| table.checked_add(len))
            .is_some_and(|end| end <= bytes.len());
        if !fits {
            return Err(MmfsError::corrupt(format!(
                "directory at {base:#x} claims {count} entries"
            )));
        }
        Ok(Self {
            bytes,
            base,
            table,
            count,
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if the directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn record(&self, index: usize) -> &'a [u8] {
        let at = self.table + index * ENTRY_SIZE;
        &self.bytes[at..at + ENTRY_SIZE]
    }

    fn raw_name(&self, index: usize) -> &'a [u8] {
        trim_name(&self.record(index)[..NAME_FIELD_LEN])
    }

    /// Decode the entry at `index`, or `None` past the end.
    pub fn entry(&self, index: usize) -> Option<MmfsResult<Entry>> {
        (index < self.count).then(|| self.decode(index))
    }

    fn decode(&self, index: usize) -> MmfsResult<Entry> {
        let record = self.record(index);
        let name = decode_name(self.raw_name(index), self.base)?;
        let truncated = || MmfsError::corrupt(format!("truncated entry {name:?}"));
        let flags = read_u32(record, NAME_FIELD_LEN).ok_or_else(truncated)?;
        let offset = read_u32(record, NAME_FIELD_LEN + 4).ok_or_else(truncated)?;
        let (is_dir, size) = unpack_flags(flags);
        if is_dir && offset as usize <= self.base {
            return Err(MmfsError::corrupt(format!(
                "directory {name:?} at {offset:#x} does not follow its parent at {:#x}",
                self.base
            )));
        }
        Ok(Entry {
            name,
            is_dir,
            size,
            offset,
        })
    }

    /// Binary search for an exact byte-wise name match.
    ///
    /// Relies on the entries being sorted; an unsorted table produces misses,
    /// not panics.
    pub fn find(&self, name: &[u8]) -> MmfsResult<Option<Entry>> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match name.cmp(self.raw_name(mid)) {
                Ordering::Equal => return self.decode(mid).map(Some),
                Ordering::Greater => lo = mid + 1,
                Ordering::Less => hi = mid,
            }
        }
        Ok(None)
    }

    /// All entries in stored order.
    pub fn entries(&self) -> impl Iterator<Item = MmfsResult<Entry>> + use<'a> {
        let view = *self;
        (0..view.count).map(move |i| view.decode(i))
    }

    /// Entry names in stored order. Fails on the first undecodable entry.
    pub fn names(&self) -> MmfsResult<Vec<String>> {
        self.entries().map(|e| e.map(|e| e.name)).collect()
    }
}

/// A stored name must be one UTF-8 path segment.
fn decode_name(raw: &[u8], base: usize) -> MmfsResult<String> {
    let bad = |what: &str| {
        MmfsError::corrupt(format!(
            "entry {:?} in directory at {base:#x} {what}",
            String::from_utf8_lossy(raw)
        ))
    };
    let name = std::str::from_utf8(raw).map_err(|_| bad("is not UTF-8"))?;
    if name.is_empty() || name == "." || name == ".." {
        return Err(bad("is not a usable name"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(bad("contains a separator or NUL"));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArchiveBuilder;
    use crate::format::pack_flags;

    fn sample() -> Archive {
        let mut builder = ArchiveBuilder::new();
        builder.add_file("bios.lua", b"print('boot')".to_vec()).unwrap();
        builder.add_file("apis/term.lua", b"-- term".to_vec()).unwrap();
        builder.add_file("apis/colors.lua", b"-- colors".to_vec()).unwrap();
        builder.add_dir("programs/empty").unwrap();
        Archive::from_bytes(builder.build().unwrap()).unwrap()
    }

    /// Hand-assemble a single-level directory, bypassing the builder.
    fn raw_dir(entries: &[(&str, bool, u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (name, is_dir, size, offset) in entries {
            let mut field = [0u8; NAME_FIELD_LEN];
            field[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&field);
            out.extend_from_slice(&pack_flags(*is_dir, *size).to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_traverse_root() {
        let archive = sample();
        let root = archive.traverse::<&str>(&[]).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.offset(), 0);
    }

    #[test]
    fn test_traverse_nested_file() {
        let archive = sample();
        let entry = archive.traverse(&["apis", "term.lua"]).unwrap();
        assert!(!entry.is_dir());
        assert_eq!(archive.data(&entry).unwrap(), b"-- term");
    }

    #[test]
    fn test_traverse_missing() {
        let archive = sample();
        let err = archive.traverse(&["apis", "nope.lua"]).unwrap_err();
        assert!(matches!(err, MmfsError::NotFound(p) if p == "apis/nope.lua"));
    }

    #[test]
    fn test_traverse_through_file() {
        let archive = sample();
        let err = archive.traverse(&["bios.lua", "x"]).unwrap_err();
        assert!(matches!(err, MmfsError::NotADirectory(p) if p == "bios.lua"));
    }

    #[test]
    fn test_listing_is_sorted() {
        let archive = sample();
        let apis = archive.traverse(&["apis"]).unwrap();
        let names = archive.read_dir(&apis).unwrap().names().unwrap();
        assert_eq!(names, vec!["colors.lua", "term.lua"]);
        let root = archive.root().unwrap().names().unwrap();
        assert_eq!(root, vec!["apis", "bios.lua", "programs"]);
    }

    #[test]
    fn test_empty_directory() {
        let archive = sample();
        let empty = archive.traverse(&["programs", "empty"]).unwrap();
        assert!(archive.read_dir(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = raw_dir(&[]);
        bytes[0] = b'X';
        assert!(matches!(Archive::from_bytes(bytes), Err(MmfsError::Corrupt(_))));
        assert!(matches!(Archive::from_bytes(vec![1, 2]), Err(MmfsError::Corrupt(_))));
    }

    #[test]
    fn test_count_past_end_rejected() {
        let mut bytes = raw_dir(&[]);
        bytes[4..8].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(Archive::from_bytes(bytes), Err(MmfsError::Corrupt(_))));
    }

    #[test]
    fn test_out_of_range_offsets_are_corrupt() {
        let bytes = raw_dir(&[("dir", true, 0, 9999), ("file", false, 64, 9999)]);
        let archive = Archive::from_bytes(bytes).unwrap();
        assert!(matches!(
            archive.traverse(&["dir", "x"]),
            Err(MmfsError::Corrupt(_))
        ));
        let file = archive.traverse(&["file"]).unwrap();
        assert!(matches!(archive.data(&file), Err(MmfsError::Corrupt(_))));
    }

    #[test]
    fn test_unsorted_directory_misses_silently() {
        // Sorted order would be "a", "m", "z".
        let bytes = raw_dir(&[("z", false, 0, 0), ("a", false, 0, 0), ("m", false, 0, 0)]);
        let archive = Archive::from_bytes(bytes).unwrap();
        assert!(archive.traverse(&["m"]).is_ok());
        assert!(matches!(archive.traverse(&["z"]), Err(MmfsError::NotFound(_))));
    }

    #[test]
    fn test_names_that_leave_the_directory_are_corrupt() {
        for name in ["..", ".", "../../escape", "a\\b"] {
            let archive = Archive::from_bytes(raw_dir(&[(name, false, 0, 0)])).unwrap();
            assert!(
                matches!(archive.root().unwrap().names(), Err(MmfsError::Corrupt(_))),
                "{name:?} accepted"
            );
        }
    }

    #[test]
    fn test_non_utf8_name_is_corrupt() {
        let mut bytes = raw_dir(&[("ab", false, 0, 0)]);
        bytes[HEADER_SIZE] = 0xff;
        let archive = Archive::from_bytes(bytes).unwrap();
        let root = archive.root().unwrap();
        assert!(matches!(root.entry(0), Some(Err(MmfsError::Corrupt(_)))));
        assert!(root.entry(1).is_none());
    }

    #[test]
    fn test_directory_pointing_back_is_corrupt() {
        // "loop" names the root table it sits in.
        let archive = Archive::from_bytes(raw_dir(&[("loop", true, 0, 0)])).unwrap();
        assert!(matches!(archive.traverse(&["loop"]), Err(MmfsError::Corrupt(_))));
        assert!(archive.root().unwrap().names().is_err());
    }

    #[test]
    fn test_full_width_name_without_nul() {
        let name = "abcdefghijklmnopqrstuvwx";
        assert_eq!(name.len(), NAME_FIELD_LEN);
        let archive = Archive::from_bytes(raw_dir(&[(name, false, 0, 0)])).unwrap();
        assert_eq!(archive.traverse(&[name]).unwrap().name(), name);
    }
}
