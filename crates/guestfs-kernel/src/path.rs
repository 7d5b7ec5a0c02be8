//! Guest path normalization.
//!
//! Raw guest paths are turned into a list of clean segments:
//!
//! 1. `" * : < > ? |` and control characters are removed.
//! 2. The string is split on `/` and `\`.
//! 3. Each token is cut to 255 bytes and trimmed of surrounding spaces.
//! 4. `..` pops the previous segment. Anything else loses trailing dots and
//!    spaces and is dropped if that leaves it empty (`.`, `...`, blanks).
//!
//! A `..` with nothing left to pop is an error under [`DotDotPolicy::Strict`]
//! and a literal segment under [`DotDotPolicy::Lenient`]. Everything that
//! reaches a mount uses `Strict`; only [`combine`], [`get_name`] and
//! [`get_dir`] are lenient.

use std::fmt;

use crate::error::{FsError, FsResult};

/// Longest segment kept, in bytes. Longer names are truncated.
pub const MAX_SEGMENT_LEN: usize = 255;

/// How a `..` that would climb above the root is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DotDotPolicy {
    /// Reject with [`FsError::InvalidPath`].
    #[default]
    Strict,
    /// Keep it as a literal `..` segment.
    Lenient,
}

/// A normalized, `/`-rooted guest path.
///
/// Never holds an empty segment. Under the strict policy it never holds `..`
/// either, so it is safe to join onto a host root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GuestPath {
    segments: Vec<String>,
}

impl GuestPath {
    /// The root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Normalize with the strict `..` policy.
    pub fn parse(raw: &str) -> FsResult<Self> {
        Self::parse_with(raw, DotDotPolicy::Strict)
    }

    /// Normalize with an explicit `..` policy.
    pub fn parse_with(raw: &str, policy: DotDotPolicy) -> FsResult<Self> {
        let cleaned: String = raw.chars().filter(|&c| !is_illegal(c)).collect();
        let mut segments: Vec<String> = Vec::new();

        for token in cleaned.split(['/', '\\']) {
            let token = truncate(token, MAX_SEGMENT_LEN).trim_matches(' ');
            if token == ".." {
                match segments.last() {
                    Some(last) if last != ".." => {
                        segments.pop();
                    }
                    _ => match policy {
                        DotDotPolicy::Strict => {
                            return Err(FsError::invalid_path(raw.trim_start_matches(['/', '\\'])));
                        }
                        DotDotPolicy::Lenient => segments.push("..".to_string()),
                    },
                }
                continue;
            }
            let token = token.trim_end_matches(['.', ' ']);
            if !token.is_empty() {
                segments.push(token.to_string());
            }
        }

        Ok(Self { segments })
    }

    /// The clean segments, root-first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments (0 for the root).
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true for the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, or `None` at the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent path, or `None` at the root.
    pub fn parent(&self) -> Option<GuestPath> {
        if self.is_root() {
            return None;
        }
        Some(self.truncated(self.len() - 1))
    }

    /// The first `len` segments.
    pub fn truncated(&self, len: usize) -> GuestPath {
        Self {
            segments: self.segments[..len.min(self.len())].to_vec(),
        }
    }

    /// Append an already-clean child name.
    pub fn join(&self, name: &str) -> GuestPath {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    /// Segment-wise prefix test. Every path starts with the root.
    pub fn starts_with(&self, prefix: &GuestPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Segments after `prefix`, if `prefix` is a prefix.
    pub fn strip_prefix(&self, prefix: &GuestPath) -> Option<&[String]> {
        self.segments.strip_prefix(prefix.segments.as_slice())
    }
}

impl From<Vec<String>> for GuestPath {
    /// Wrap segments that are already clean (e.g. names read back from a
    /// directory listing).
    fn from(segments: Vec<String>) -> Self {
        Self { segments }
    }
}

impl fmt::Display for GuestPath {
    /// Segments joined with `/`, without a leading slash.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

fn is_illegal(c: char) -> bool {
    matches!(c, '"' | '*' | ':' | '<' | '>' | '?' | '|') || c.is_control()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn lenient(raw: &str) -> GuestPath {
    // Lenient parsing has no error path.
    GuestPath::parse_with(raw, DotDotPolicy::Lenient).unwrap_or_default()
}

/// Join path parts and normalize the result. Empty parts are skipped and one
/// leading separator is dropped from each part.
///
/// ```
/// use guestfs_kernel::combine;
///
/// assert_eq!(combine("rom", &["apis", "io.lua"]), "rom/apis/io.lua");
/// assert_eq!(combine("..", &["a"]), "../a");
/// ```
pub fn combine(base: &str, parts: &[&str]) -> String {
    let mut joined = base.to_string();
    for part in parts.iter().copied().filter(|p| !p.is_empty()) {
        let part = part.strip_prefix(['/', '\\']).unwrap_or(part);
        joined.push('/');
        joined.push_str(part);
    }
    lenient(&joined).to_string()
}

/// Final component of a path, or `root` for the root.
pub fn get_name(raw: &str) -> String {
    match lenient(raw).name() {
        Some(name) => name.to_string(),
        None => "root".to_string(),
    }
}

/// Parent of a path, or `..` for the root.
pub fn get_dir(raw: &str) -> String {
    let path = lenient(raw);
    match path.parent() {
        Some(parent) => parent.to_string(),
        None => "..".to_string(),
    }
}
