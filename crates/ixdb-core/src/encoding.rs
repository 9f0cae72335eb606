//! Byte-level helpers shared by the identity codec and the index key layout.
//!
//! Variable-length byte strings are written escaped and terminated by
//! [`TAG_SEPARATOR`]. A concatenation of such strings sorts like the tuple of
//! its parts and can be split again without length prefixes, which is what
//! makes prefix scans over tag values possible.

use crate::error::{CoreError, Result};

/// Terminates every escaped byte string
pub const TAG_SEPARATOR: u8 = 0;

const ESCAPE: u8 = 1;
const ESCAPED_SEPARATOR: u8 = 2;
const ESCAPED_ESCAPE: u8 = 3;

/// Append `src` escaped, without a terminator.
///
/// The escaped form of a prefix is a prefix of the escaped form of the whole
/// string, so this is also what range-scan hints are built from.
pub fn marshal_escaped(dst: &mut Vec<u8>, src: &[u8]) {
    for &b in src {
        match b {
            TAG_SEPARATOR => dst.extend_from_slice(&[ESCAPE, ESCAPED_SEPARATOR]),
            ESCAPE => dst.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            _ => dst.push(b),
        }
    }
}

/// Append `src` escaped and terminated
pub fn marshal_tag_value(dst: &mut Vec<u8>, src: &[u8]) {
    marshal_escaped(dst, src);
    dst.push(TAG_SEPARATOR);
}

/// Decode one escaped, terminated string from the front of `src` into `dst`.
///
/// Returns the bytes following the terminator.
pub fn unmarshal_tag_value<'a>(dst: &mut Vec<u8>, src: &'a [u8]) -> Result<&'a [u8]> {
    let end = src
        .iter()
        .position(|&b| b == TAG_SEPARATOR)
        .ok_or_else(|| CoreError::InvalidIdentity("missing tag separator".to_string()))?;

    let body = &src[..end];
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if b != ESCAPE {
            dst.push(b);
            i += 1;
            continue;
        }
        match body.get(i + 1) {
            Some(&ESCAPED_SEPARATOR) => dst.push(TAG_SEPARATOR),
            Some(&ESCAPED_ESCAPE) => dst.push(ESCAPE),
            Some(other) => {
                return Err(CoreError::InvalidIdentity(format!(
                    "invalid escape sequence 0x01 0x{:02x}",
                    other
                )))
            }
            None => {
                return Err(CoreError::InvalidIdentity(
                    "truncated escape sequence".to_string(),
                ))
            }
        }
        i += 2;
    }

    Ok(&src[end + 1..])
}

/// Read a big-endian u32 from the front of `src`
pub fn read_u32_be(src: &[u8]) -> Result<(u32, &[u8])> {
    if src.len() < 4 {
        return Err(CoreError::InvalidIdentity(format!(
            "expected 4 bytes, got {}",
            src.len()
        )));
    }
    let (head, tail) = src.split_at(4);
    let mut buf = [0u8; 4];
    buf.copy_from_slice(head);
    Ok((u32::from_be_bytes(buf), tail))
}

/// Read a big-endian u64 from the front of `src`
pub fn read_u64_be(src: &[u8]) -> Result<(u64, &[u8])> {
    if src.len() < 8 {
        return Err(CoreError::InvalidIdentity(format!(
            "expected 8 bytes, got {}",
            src.len()
        )));
    }
    let (head, tail) = src.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(head);
    Ok((u64::from_be_bytes(buf), tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_roundtrip_with_reserved_bytes() {
        let raw = [b'a', 0, 1, 2, 3, b'z', 0];
        let mut buf = Vec::new();
        marshal_tag_value(&mut buf, &raw);
        marshal_tag_value(&mut buf, b"next");

        let mut first = Vec::new();
        let tail = unmarshal_tag_value(&mut first, &buf).unwrap();
        assert_eq!(first, raw);

        let mut second = Vec::new();
        let tail = unmarshal_tag_value(&mut second, tail).unwrap();
        assert_eq!(second, b"next");
        assert!(tail.is_empty());
    }

    #[test]
    fn test_escaped_order_matches_raw_order() {
        let mut values: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            vec![0],
            vec![0, 0],
            vec![1],
            vec![2],
            b"a".to_vec(),
            b"ab".to_vec(),
            b"b".to_vec(),
        ];
        values.sort();

        let encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| {
                let mut buf = Vec::new();
                marshal_tag_value(&mut buf, v);
                buf
            })
            .collect();

        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn test_escaped_prefix_is_prefix() {
        let mut full = Vec::new();
        marshal_escaped(&mut full, &[b'x', 0, 1, b'y']);
        let mut prefix = Vec::new();
        marshal_escaped(&mut prefix, &[b'x', 0]);
        assert!(full.starts_with(&prefix));
    }

    #[test]
    fn test_unmarshal_errors() {
        let mut dst = Vec::new();
        assert!(unmarshal_tag_value(&mut dst, b"no-terminator").is_err());
        assert!(unmarshal_tag_value(&mut dst, &[b'a', ESCAPE, 9, 0]).is_err());
        assert!(unmarshal_tag_value(&mut dst, &[b'a', ESCAPE, 0]).is_err());
    }

    #[test]
    fn test_read_be_integers() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&42u64.to_be_bytes());

        let (a, tail) = read_u32_be(&buf).unwrap();
        let (b, tail) = read_u64_be(tail).unwrap();
        assert_eq!(a, 7);
        assert_eq!(b, 42);
        assert!(tail.is_empty());
        assert!(read_u64_be(&[1, 2, 3]).is_err());
    }
}
