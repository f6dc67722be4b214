//! Shared primitives for the versioned big-endian cache index files.
//!
//! Both cache indexes use the same envelope: a u32 magic, a u8 version,
//! then length-prefixed fields with all integers big-endian. Readers
//! reject unknown magics and versions outright.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mason_error::{BuildError, ErrorCode, Result};
use std::io::{Cursor, Read, Write};

pub(crate) fn corrupted(msg: impl Into<String>) -> BuildError {
    BuildError::new(ErrorCode::CacheCorrupted, msg)
}

pub(crate) fn write_envelope(out: &mut Vec<u8>, magic: u32, version: u8) {
    out.write_u32::<BigEndian>(magic).expect("vec write");
    out.write_u8(version).expect("vec write");
}

pub(crate) fn check_envelope(
    cursor: &mut Cursor<&[u8]>,
    magic: u32,
    version: u8,
    what: &str,
) -> Result<()> {
    let found_magic = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| corrupted(format!("{what}: truncated header")))?;
    if found_magic != magic {
        return Err(corrupted(format!(
            "{what}: bad magic {found_magic:#010x}, expected {magic:#010x}"
        )));
    }
    let found_version = cursor
        .read_u8()
        .map_err(|_| corrupted(format!("{what}: truncated header")))?;
    if found_version != version {
        return Err(corrupted(format!(
            "{what}: unsupported version {found_version}"
        )));
    }
    Ok(())
}

pub(crate) fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.write_u64::<BigEndian>(bytes.len() as u64).expect("vec write");
    out.write_all(bytes).expect("vec write");
}

pub(crate) fn write_str(out: &mut Vec<u8>, s: &str) {
    write_bytes(out, s.as_bytes());
}

pub(crate) fn read_bytes(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<Vec<u8>> {
    let len = cursor
        .read_u64::<BigEndian>()
        .map_err(|_| corrupted(format!("{what}: truncated length")))?;
    // An index whose declared length exceeds the buffer is corrupt, not
    // an allocation request.
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len > remaining {
        return Err(corrupted(format!("{what}: length {len} exceeds data")));
    }
    let mut buf = vec![0u8; len as usize];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| corrupted(format!("{what}: truncated field")))?;
    Ok(buf)
}

pub(crate) fn read_str(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<String> {
    let bytes = read_bytes(cursor, what)?;
    String::from_utf8(bytes).map_err(|_| corrupted(format!("{what}: invalid utf-8")))
}

pub(crate) fn read_u64(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u64> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|_| corrupted(format!("{what}: truncated u64")))
}

pub(crate) fn read_u8(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u8> {
    cursor
        .read_u8()
        .map_err(|_| corrupted(format!("{what}: truncated u8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        let mut out = Vec::new();
        write_bytes(&mut out, b"hello");
        write_str(&mut out, "world");

        let slice: &[u8] = &out;
        let mut cursor = Cursor::new(slice);
        assert_eq!(read_bytes(&mut cursor, "a").unwrap(), b"hello");
        assert_eq!(read_str(&mut cursor, "b").unwrap(), "world");
    }

    #[test]
    fn test_envelope_rejects_wrong_magic() {
        let mut out = Vec::new();
        write_envelope(&mut out, 0x42544C4D, 1);
        let slice: &[u8] = &out;
        let mut cursor = Cursor::new(slice);
        assert!(check_envelope(&mut cursor, 0x42544143, 1, "index").is_err());
    }

    #[test]
    fn test_envelope_rejects_unknown_version() {
        let mut out = Vec::new();
        write_envelope(&mut out, 0x42544C4D, 9);
        let slice: &[u8] = &out;
        let mut cursor = Cursor::new(slice);
        let err = check_envelope(&mut cursor, 0x42544C4D, 1, "index").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CacheCorrupted);
    }

    #[test]
    fn test_oversized_length_is_corruption_not_allocation() {
        let mut out = Vec::new();
        out.write_u64::<BigEndian>(u64::MAX).unwrap();
        let slice: &[u8] = &out;
        let mut cursor = Cursor::new(slice);
        assert!(read_bytes(&mut cursor, "field").is_err());
    }
}
