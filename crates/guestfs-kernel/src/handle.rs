//! Open file handles.
//!
//! A handle wraps either a host file or an archive slice and holds one slot
//! of the machine's open-file budget. The slot is released exactly once, by
//! [`FileHandle::close`] or by dropping the handle.

use std::fmt;
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use guestfs_mmfs::FileSlice;

use crate::error::{FsError, FsResult};
use crate::host::HostFile;
use crate::mode::{OpenMode, SeekWhence};
use crate::path::GuestPath;

const LINE_CHUNK: usize = 256;

/// One unit of the open-file budget. Decrements the shared counter on drop.
pub(crate) struct OpenFileSlot {
    counter: Arc<AtomicUsize>,
}

impl OpenFileSlot {
    /// Take a slot if fewer than `limit` are taken.
    pub(crate) fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()?;
        Some(Self {
            counter: Arc::clone(counter),
        })
    }
}

impl Drop for OpenFileSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) enum Stream {
    Host(Box<dyn HostFile>),
    Archive(FileSlice),
}

struct Open {
    stream: Stream,
    _slot: OpenFileSlot,
}

/// A file opened through [`FileSystem::open`](crate::FileSystem::open).
///
/// Reads return `None` at end of file. Operations the open mode does not
/// allow fail with [`FsError::Unsupported`]; anything after `close` fails
/// with [`FsError::ClosedFile`].
pub struct FileHandle {
    path: GuestPath,
    mode: OpenMode,
    open: Option<Open>,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path.to_string())
            .field("mode", &self.mode.to_string())
            .field("closed", &self.open.is_none())
            .finish()
    }
}

impl FileHandle {
    pub(crate) fn new(path: GuestPath, mode: OpenMode, stream: Stream, slot: OpenFileSlot) -> Self {
        Self {
            path,
            mode,
            open: Some(Open {
                stream,
                _slot: slot,
            }),
        }
    }

    pub fn path(&self) -> &GuestPath {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.open.is_none()
    }

    /// True for handles reading out of an archive image.
    pub fn is_archive(&self) -> bool {
        matches!(
            self.open,
            Some(Open {
                stream: Stream::Archive(_),
                ..
            })
        )
    }

    fn stream(&mut self) -> FsResult<&mut Stream> {
        self.open
            .as_mut()
            .map(|o| &mut o.stream)
            .ok_or(FsError::ClosedFile)
    }

    fn readable(&mut self) -> FsResult<&mut Stream> {
        let can_read = self.mode.can_read();
        let stream = self.stream()?;
        if !can_read {
            return Err(FsError::Unsupported("reading"));
        }
        Ok(stream)
    }

    fn writable(&mut self) -> FsResult<&mut Box<dyn HostFile>> {
        let can_write = self.mode.can_write();
        match self.stream()? {
            Stream::Host(file) if can_write => Ok(file),
            _ => Err(FsError::Unsupported("writing")),
        }
    }

    /// Read up to `n` bytes. `Some(vec![])` for `n == 0` before end of file.
    ///
    /// The buffer grows with what is actually read, so a huge `n` costs no
    /// more than the rest of the file.
    pub fn read(&mut self, n: usize) -> FsResult<Option<Vec<u8>>> {
        let stream = self.readable()?;
        let limit = u64::try_from(n).unwrap_or(u64::MAX);
        let mut buf = Vec::new();
        match stream {
            Stream::Host(file) => Read::by_ref(file).take(limit).read_to_end(&mut buf)?,
            Stream::Archive(slice) => Read::by_ref(slice).take(limit).read_to_end(&mut buf)?,
        };
        if buf.is_empty() && (n > 0 || at_eof(stream)?) {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    /// Read one byte.
    pub fn read_byte(&mut self) -> FsResult<Option<u8>> {
        Ok(self.read(1)?.and_then(|b| b.first().copied()))
    }

    /// Read the next line. The trailing `\n` is kept only with
    /// `keep_newline`. `None` at end of file.
    pub fn read_line(&mut self, keep_newline: bool) -> FsResult<Option<Vec<u8>>> {
        let stream = self.readable()?;
        let mut line = Vec::new();
        match stream {
            Stream::Archive(slice) => {
                slice.read_until(b'\n', &mut line)?;
            }
            Stream::Host(file) => {
                let mut chunk = [0u8; LINE_CHUNK];
                loop {
                    let got = file.read(&mut chunk)?;
                    if got == 0 {
                        break;
                    }
                    if let Some(i) = chunk[..got].iter().position(|&b| b == b'\n') {
                        line.extend_from_slice(&chunk[..=i]);
                        let overshoot = (got - i - 1) as i64;
                        if overshoot > 0 {
                            file.seek(SeekFrom::Current(-overshoot))?;
                        }
                        break;
                    }
                    line.extend_from_slice(&chunk[..got]);
                }
            }
        }
        if line.is_empty() {
            return Ok(None);
        }
        if !keep_newline && line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Read everything from the cursor to the end. Empty at end of file.
    pub fn read_all(&mut self) -> FsResult<Vec<u8>> {
        let stream = self.readable()?;
        let mut out = Vec::new();
        match stream {
            Stream::Host(file) => file.read_to_end(&mut out)?,
            Stream::Archive(slice) => slice.read_to_end(&mut out)?,
        };
        Ok(out)
    }

    pub fn write(&mut self, data: &[u8]) -> FsResult<()> {
        self.writable()?.write_all(data)?;
        Ok(())
    }

    /// Write `data` followed by `\n`.
    pub fn write_line(&mut self, data: &[u8]) -> FsResult<()> {
        let file = self.writable()?;
        file.write_all(data)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn write_byte(&mut self, byte: u8) -> FsResult<()> {
        self.write(&[byte])
    }

    pub fn flush(&mut self) -> FsResult<()> {
        self.writable()?.flush()?;
        Ok(())
    }

    /// Move the cursor and return the new position.
    ///
    /// A negative offset from [`SeekWhence::Set`] is rejected. Archive
    /// handles clamp to the file's bounds; host handles reject positions
    /// before the start.
    pub fn seek(&mut self, whence: SeekWhence, offset: i64) -> FsResult<u64> {
        let stream = self.stream()?;
        let target = match whence {
            SeekWhence::Set => {
                let Ok(pos) = u64::try_from(offset) else {
                    return Err(FsError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "Position is negative",
                    )));
                };
                SeekFrom::Start(pos)
            }
            SeekWhence::Cur => SeekFrom::Current(offset),
            SeekWhence::End => SeekFrom::End(offset),
        };
        let pos = match stream {
            Stream::Host(file) => file.seek(target)?,
            Stream::Archive(slice) => slice.seek(target)?,
        };
        Ok(pos)
    }

    /// Flush and release the handle. A second close fails with
    /// [`FsError::ClosedFile`].
    pub fn close(&mut self) -> FsResult<()> {
        let mut open = self.open.take().ok_or(FsError::ClosedFile)?;
        if let Stream::Host(file) = &mut open.stream {
            if self.mode.can_write() {
                file.flush()?;
            }
        }
        tracing::trace!(path = %self.path, "closed file");
        Ok(())
    }
}

fn at_eof(stream: &mut Stream) -> FsResult<bool> {
    Ok(match stream {
        Stream::Archive(slice) => slice.is_eof(),
        Stream::Host(file) => {
            let pos = file.stream_position()?;
            let end = file.seek(SeekFrom::End(0))?;
            file.seek(SeekFrom::Start(pos))?;
            pos >= end
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestfs_mmfs::{Archive, ArchiveBuilder};
    use std::io::Cursor;

    fn slot(counter: &Arc<AtomicUsize>) -> OpenFileSlot {
        OpenFileSlot::acquire(counter, 128).unwrap()
    }

    fn archive_handle(content: &[u8], counter: &Arc<AtomicUsize>) -> FileHandle {
        let mut builder = ArchiveBuilder::new();
        builder.add_file("f", content.to_vec()).unwrap();
        let archive = Archive::from_bytes(builder.build().unwrap()).unwrap();
        let entry = archive.traverse(&["f"]).unwrap();
        let slice = archive.open(&entry).unwrap();
        FileHandle::new(GuestPath::parse("rom/f").unwrap(), OpenMode::READ, Stream::Archive(slice), slot(counter))
    }

    fn host_handle(content: &[u8], mode: OpenMode, counter: &Arc<AtomicUsize>) -> FileHandle {
        let file: Box<dyn HostFile> = Box::new(Cursor::new(content.to_vec()));
        FileHandle::new(GuestPath::parse("f").unwrap(), mode, Stream::Host(file), slot(counter))
    }

    #[test]
    fn test_slot_budget() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = OpenFileSlot::acquire(&counter, 2).unwrap();
        let _b = OpenFileSlot::acquire(&counter, 2).unwrap();
        assert!(OpenFileSlot::acquire(&counter, 2).is_none());
        drop(a);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        assert!(OpenFileSlot::acquire(&counter, 2).is_some());
    }

    #[test]
    fn test_close_releases_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut h = archive_handle(b"x", &counter);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        h.close().unwrap();
        assert_eq!(counter.load(Ordering::Acquire), 0);
        assert!(matches!(h.close(), Err(FsError::ClosedFile)));
        assert!(matches!(h.read_all(), Err(FsError::ClosedFile)));
        drop(h);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_drop_releases() {
        let counter = Arc::new(AtomicUsize::new(0));
        let h = host_handle(b"x", OpenMode::READ, &counter);
        drop(h);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_read_lines_both_backends() {
        let counter = Arc::new(AtomicUsize::new(0));
        let content = b"first\nsecond\n\nlast";
        for mut h in [
            archive_handle(content, &counter),
            host_handle(content, OpenMode::READ, &counter),
        ] {
            assert_eq!(h.read_line(false).unwrap().unwrap(), b"first");
            assert_eq!(h.read_line(true).unwrap().unwrap(), b"second\n");
            assert_eq!(h.read_line(false).unwrap().unwrap(), b"");
            assert_eq!(h.read_line(false).unwrap().unwrap(), b"last");
            assert_eq!(h.read_line(false).unwrap(), None);
        }
    }

    #[test]
    fn test_long_line_on_host() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut content = vec![b'a'; LINE_CHUNK * 2 + 10];
        content.extend_from_slice(b"\ntail");
        let mut h = host_handle(&content, OpenMode::READ, &counter);
        assert_eq!(h.read_line(false).unwrap().unwrap().len(), LINE_CHUNK * 2 + 10);
        assert_eq!(h.read_all().unwrap(), b"tail");
    }

    #[test]
    fn test_read_counts_and_eof() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut h = archive_handle(b"abcdef", &counter);
        assert_eq!(h.read(0).unwrap().unwrap(), b"");
        assert_eq!(h.read(4).unwrap().unwrap(), b"abcd");
        assert_eq!(h.read(10).unwrap().unwrap(), b"ef");
        assert_eq!(h.read(1).unwrap(), None);
        assert_eq!(h.read(0).unwrap(), None);
        assert_eq!(h.read_byte().unwrap(), None);
        assert!(h.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_oversized_read_count() {
        let counter = Arc::new(AtomicUsize::new(0));
        for mut h in [
            archive_handle(b"boot", &counter),
            host_handle(b"boot", OpenMode::READ, &counter),
        ] {
            assert_eq!(h.read(usize::MAX).unwrap().unwrap(), b"boot");
            assert_eq!(h.read(1 << 40).unwrap(), None);
        }
    }

    #[test]
    fn test_seek() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut h = archive_handle(b"0123456789", &counter);
        assert_eq!(h.seek(SeekWhence::End, -3).unwrap(), 7);
        assert_eq!(h.read_all().unwrap(), b"789");
        assert_eq!(h.seek(SeekWhence::Cur, -100).unwrap(), 0);
        assert!(h.seek(SeekWhence::Set, -1).is_err());
        assert_eq!(h.seek(SeekWhence::Set, 4).unwrap(), 4);
        assert_eq!(h.read_byte().unwrap(), Some(b'4'));

        let mut h = host_handle(b"0123456789", OpenMode::READ, &counter);
        assert!(h.seek(SeekWhence::Set, -1).is_err());
        assert_eq!(h.seek(SeekWhence::End, 0).unwrap(), 10);
    }

    #[test]
    fn test_capabilities_follow_mode() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut r = archive_handle(b"x", &counter);
        assert!(matches!(r.write(b"y"), Err(FsError::Unsupported(_))));

        let mut w = host_handle(b"", OpenMode::WRITE, &counter);
        assert!(matches!(w.read_all(), Err(FsError::Unsupported(_))));
        w.write_line(b"hello").unwrap();
        w.write_byte(b'!').unwrap();
        w.flush().unwrap();
        w.close().unwrap();
    }
}
