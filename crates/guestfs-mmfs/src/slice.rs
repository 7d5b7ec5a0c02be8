//! Read cursor over a file stored in an archive.

use std::fmt;
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use std::sync::Arc;

/// A `start..end` window into a shared archive buffer with its own cursor.
///
/// Implements [`Read`], [`BufRead`] and [`Seek`]. Seeking is clamped to the
/// window on both sides, so a slice can never observe bytes outside its file.
#[derive(Clone)]
pub struct FileSlice {
    data: Arc<[u8]>,
    start: usize,
    end: usize,
    pos: usize,
}

impl fmt::Debug for FileSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSlice")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("pos", &self.pos)
            .finish()
    }
}

impl FileSlice {
    pub(crate) fn new(data: Arc<[u8]>, start: usize, end: usize) -> Self {
        Self {
            data,
            start,
            end,
            pos: start,
        }
    }

    /// File length in bytes.
    pub fn len(&self) -> u64 {
        (self.end - self.start) as u64
    }

    /// Returns true for an empty file.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Cursor position relative to the start of the file.
    pub fn position(&self) -> u64 {
        (self.pos - self.start) as u64
    }

    /// Returns true once every byte has been consumed.
    pub fn is_eof(&self) -> bool {
        self.pos >= self.end
    }

    /// Unread bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..self.end]
    }

    /// The whole file, regardless of the cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn seek_to(&mut self, target: i128) -> u64 {
        let clamped = target.clamp(self.start as i128, self.end as i128);
        self.pos = clamped as usize;
        self.position()
    }
}

impl Read for FileSlice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.remaining().len().min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl BufRead for FileSlice {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Ok(&self.data[self.pos..self.end])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.end);
    }
}

impl Seek for FileSlice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => self.start as i128 + n as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.end as i128 + d as i128,
        };
        Ok(self.seek_to(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(content: &[u8]) -> FileSlice {
        // Pad on both sides so clamping is observable.
        let mut data = b"<<".to_vec();
        data.extend_from_slice(content);
        data.extend_from_slice(b">>");
        let end = 2 + content.len();
        FileSlice::new(Arc::from(data), 2, end)
    }

    #[test]
    fn test_read_to_end_once() {
        let mut f = slice(b"hello");
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert!(f.is_eof());
        out.clear();
        assert_eq!(f.read_to_end(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_lines() {
        let mut f = slice(b"one\ntwo\nthree");
        let mut line = Vec::new();
        f.read_until(b'\n', &mut line).unwrap();
        assert_eq!(line, b"one\n");
        let rest: Vec<_> = f.lines().map(|l| l.unwrap()).collect();
        assert_eq!(rest, vec!["two", "three"]);
    }

    #[test]
    fn test_seek_clamps_to_window() {
        let mut f = slice(b"abcdef");
        assert_eq!(f.seek(SeekFrom::Current(-10)).unwrap(), 0);
        assert_eq!(f.seek(SeekFrom::Start(100)).unwrap(), 6);
        assert_eq!(f.seek(SeekFrom::End(-2)).unwrap(), 4);
        let mut buf = [0u8; 8];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[test]
    fn test_as_slice_ignores_cursor() {
        let mut f = slice(b"xyz");
        f.seek(SeekFrom::Start(2)).unwrap();
        assert_eq!(f.as_slice(), b"xyz");
        assert_eq!(f.remaining(), b"z");
        assert_eq!(f.len(), 3);
    }
}
