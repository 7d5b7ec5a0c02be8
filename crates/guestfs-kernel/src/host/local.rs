//! Local disk host I/O.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{HostFile, HostIo, HostStat, HostStatVfs};
use crate::mode::{ModeKind, OpenMode};

/// Host I/O backed by the real filesystem.
///
/// Stateless; mount roots live in the mount table. Guest segments are
/// already free of `..`, so a joined path stays under its mount root unless
/// the host itself has a symlink pointing out.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHostIo;

impl LocalHostIo {
    pub fn new() -> Self {
        Self
    }

    /// Expand `~` and canonicalize a directory meant to become a mount root.
    ///
    /// Uses dunce so Windows roots don't pick up a `\\?\` prefix.
    pub fn canonical_root(root: impl AsRef<Path>) -> io::Result<PathBuf> {
        let raw = root.as_ref().to_string_lossy();
        let expanded: PathBuf = shellexpand::tilde(&raw).as_ref().into();
        let canonical = dunce::canonicalize(&expanded)?;
        if !canonical.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", canonical.display()),
            ));
        }
        Ok(canonical)
    }
}

impl HostIo for LocalHostIo {
    fn stat(&self, path: &Path) -> io::Result<HostStat> {
        let meta = fs::metadata(path)?;
        Ok(HostStat {
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok(),
            created: meta.created().ok(),
        })
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn HostFile>> {
        let mut options = fs::OpenOptions::new();
        options.read(mode.can_read());
        match mode.kind() {
            ModeKind::Read => {
                options.write(mode.can_write());
            }
            ModeKind::Write => {
                options.write(true).create(true).truncate(true);
            }
            ModeKind::Append => {
                options.append(true).create(true);
            }
        }
        Ok(Box::new(options.open(path)?))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn statvfs(&self, path: &Path) -> io::Result<HostStatVfs> {
        #[cfg(unix)]
        {
            let stat = rustix::fs::statvfs(path)?;
            Ok(HostStatVfs {
                blocks: stat.f_blocks,
                bavail: stat.f_bavail,
                bsize: stat.f_frsize.max(1),
            })
        }

        #[cfg(not(unix))]
        {
            fs::metadata(path)?;
            Ok(HostStatVfs::default())
        }
    }

    fn access_writable(&self, path: &Path) -> io::Result<bool> {
        #[cfg(unix)]
        {
            use rustix::fs::{Access, access};
            match access(path, Access::WRITE_OK) {
                Ok(()) => Ok(true),
                Err(rustix::io::Errno::ACCESS | rustix::io::Errno::ROFS) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }

        #[cfg(not(unix))]
        {
            Ok(!fs::metadata(path)?.permissions().readonly())
        }
    }
}
