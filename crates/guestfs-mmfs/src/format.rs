//! On-disk layout of an mmfs image.
//!
//! ```text
//! directory := magic: u32 ("MMfs") | count: u32 | entry[count]
//! entry     := name: [u8; 24] (NUL-padded) | flags: u32 | offset: u32
//! flags     := bit 0 = is_dir, bits 1..=31 = size
//! ```
//!
//! All integers are little-endian. Offsets are relative to the start of the
//! image, and the root directory sits at offset 0. Entries in a directory are
//! sorted ascending by byte-wise name so lookups can binary search.

/// Directory magic, the bytes `MMfs` read as a little-endian `u32`.
pub const MAGIC: u32 = 0x7366_4D4D;

/// Size of a directory header (magic + count).
pub const HEADER_SIZE: usize = 8;

/// Size of one packed directory entry.
pub const ENTRY_SIZE: usize = 32;

/// Width of the NUL-padded name field.
pub const NAME_FIELD_LEN: usize = 24;

/// Longest name that still leaves room for a terminating NUL.
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

/// Largest file size representable in the 31-bit size field.
pub const MAX_FILE_SIZE: usize = (1 << 31) - 1;

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Name bytes up to (not including) the first NUL.
pub(crate) fn trim_name(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

pub(crate) fn pack_flags(is_dir: bool, size: u32) -> u32 {
    (size << 1) | u32::from(is_dir)
}

pub(crate) fn unpack_flags(flags: u32) -> (bool, u32) {
    (flags & 1 == 1, flags >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_bytes() {
        assert_eq!(&MAGIC.to_le_bytes(), b"MMfs");
    }

    #[test]
    fn test_flags_bitfield() {
        assert_eq!(unpack_flags(pack_flags(true, 0)), (true, 0));
        assert_eq!(unpack_flags(pack_flags(false, 1234)), (false, 1234));
        let max = MAX_FILE_SIZE as u32;
        assert_eq!(unpack_flags(pack_flags(false, max)), (false, max));
    }

    #[test]
    fn test_trim_name() {
        let mut field = [0u8; NAME_FIELD_LEN];
        field[..4].copy_from_slice(b"boot");
        assert_eq!(trim_name(&field), b"boot");
        assert_eq!(trim_name(&[b'x'; NAME_FIELD_LEN]).len(), NAME_FIELD_LEN);
    }

    #[test]
    fn test_read_u32_bounds() {
        let bytes = [1, 0, 0, 0, 2];
        assert_eq!(read_u32(&bytes, 0), Some(1));
        assert_eq!(read_u32(&bytes, 2), None);
        assert_eq!(read_u32(&bytes, usize::MAX), None);
    }
}
