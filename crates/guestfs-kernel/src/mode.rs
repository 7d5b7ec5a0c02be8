//! Open modes and seek origins.

use std::fmt;
use std::str::FromStr;

use strum::{AsRefStr, Display, EnumString};

use crate::error::FsError;

/// Primary open mode, the first character of a mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
pub enum ModeKind {
    #[strum(serialize = "r")]
    Read,
    #[strum(serialize = "w")]
    Write,
    #[strum(serialize = "a")]
    Append,
}

/// A parsed mode string: `r`, `w` or `a`, optionally followed by `+`, `b`
/// or `+b`.
///
/// | mode | read | write | create | truncate |
/// |------|------|-------|--------|----------|
/// | `r`  | yes  |       |        |          |
/// | `r+` | yes  | yes   |        |          |
/// | `w`  |      | yes   | yes    | yes      |
/// | `w+` | yes  | yes   | yes    | yes      |
/// | `a`  |      | end   | yes    |          |
/// | `a+` | yes  | end   | yes    |          |
///
/// `b` only marks binary mode; reads and writes are bytes either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenMode {
    kind: ModeKind,
    plus: bool,
    binary: bool,
}

impl OpenMode {
    pub const READ: Self = Self::new(ModeKind::Read);
    pub const WRITE: Self = Self::new(ModeKind::Write);
    pub const APPEND: Self = Self::new(ModeKind::Append);

    const fn new(kind: ModeKind) -> Self {
        Self {
            kind,
            plus: false,
            binary: false,
        }
    }

    /// Same mode with `+`.
    pub fn with_plus(mut self) -> Self {
        self.plus = true;
        self
    }

    pub fn kind(&self) -> ModeKind {
        self.kind
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Read modes resolve in exists mode; the others create.
    pub fn creates(&self) -> bool {
        self.kind != ModeKind::Read
    }

    pub fn can_read(&self) -> bool {
        self.kind == ModeKind::Read || self.plus
    }

    pub fn can_write(&self) -> bool {
        self.kind != ModeKind::Read || self.plus
    }

    pub fn truncates(&self) -> bool {
        self.kind == ModeKind::Write
    }

    pub fn appends(&self) -> bool {
        self.kind == ModeKind::Append
    }
}

impl FromStr for OpenMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unsupported = || FsError::UnsupportedMode(s.to_string());
        let (head, tail) = s.split_at_checked(1).ok_or_else(unsupported)?;
        let kind = ModeKind::from_str(head).map_err(|_| unsupported())?;
        let (plus, binary) = match tail {
            "" => (false, false),
            "+" => (true, false),
            "b" => (false, true),
            "+b" => (true, true),
            _ => return Err(unsupported()),
        };
        Ok(Self { kind, plus, binary })
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_ref())?;
        if self.plus {
            f.write_str("+")?;
        }
        if self.binary {
            f.write_str("b")?;
        }
        Ok(())
    }
}

/// Origin for [`FileHandle::seek`](crate::FileHandle::seek).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SeekWhence {
    Set,
    #[default]
    Cur,
    End,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_grammar() {
        for ok in ["r", "w", "a", "r+", "w+", "a+", "rb", "wb", "ab", "r+b", "w+b", "a+b"] {
            let mode: OpenMode = ok.parse().unwrap();
            assert_eq!(mode.to_string(), ok);
        }
        for bad in ["", "x", "rw", "b", "+", "rb+", "r++", "R", "r+bb", "é"] {
            assert!(
                matches!(bad.parse::<OpenMode>(), Err(FsError::UnsupportedMode(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_capabilities() {
        let r: OpenMode = "r".parse().unwrap();
        assert!(r.can_read() && !r.can_write() && !r.creates());

        let r_plus: OpenMode = "r+".parse().unwrap();
        assert!(r_plus.can_read() && r_plus.can_write() && !r_plus.creates());

        let w: OpenMode = "wb".parse().unwrap();
        assert!(!w.can_read() && w.can_write() && w.truncates() && w.is_binary());

        let a: OpenMode = "a+".parse().unwrap();
        assert!(a.can_read() && a.appends() && !a.truncates());
    }

    #[test]
    fn test_seek_whence_parse() {
        assert_eq!("set".parse::<SeekWhence>().unwrap(), SeekWhence::Set);
        assert_eq!("end".parse::<SeekWhence>().unwrap(), SeekWhence::End);
        assert!("middle".parse::<SeekWhence>().is_err());
        assert_eq!(SeekWhence::default().as_ref(), "cur");
    }
}
