//! Slice-oriented `dump`/`load` pairs for the primitive wire types.
//!
//! Every `load_*` reads from the start of a slice and returns the decoded
//! value together with the number of bytes it consumed, so callers can walk a
//! buffer of concatenated values themselves.

use crate::deserialize::{self, Cursor, Deserializable, Error};
use crate::engine::EncodeError;
use crate::serialize::{Serializable, check_bytes_len};

fn load_with<T: Deserializable>(bytes: &[u8]) -> deserialize::Result<(T, usize)> {
    let mut cur = Cursor::from_slice(bytes);
    let value = T::deserialize(&mut cur)?;
    Ok((value, cur.pos()))
}

/// `int`: 4 bytes little-endian.
pub fn dump_int(v: i32) -> Vec<u8> { v.to_bytes() }
/// Inverse of [`dump_int`].
pub fn load_int(bytes: &[u8]) -> deserialize::Result<(i32, usize)> { load_with(bytes) }

/// `long`: 8 bytes little-endian.
pub fn dump_long(v: i64) -> Vec<u8> { v.to_bytes() }
/// Inverse of [`dump_long`].
pub fn load_long(bytes: &[u8]) -> deserialize::Result<(i64, usize)> { load_with(bytes) }

/// `int128`: 16 raw bytes.
pub fn dump_int128(v: &[u8; 16]) -> Vec<u8> { v.to_bytes() }
/// Inverse of [`dump_int128`].
pub fn load_int128(bytes: &[u8]) -> deserialize::Result<([u8; 16], usize)> { load_with(bytes) }

/// `int256`: 32 raw bytes.
pub fn dump_int256(v: &[u8; 32]) -> Vec<u8> { v.to_bytes() }
/// Inverse of [`dump_int256`].
pub fn load_int256(bytes: &[u8]) -> deserialize::Result<([u8; 32], usize)> { load_with(bytes) }

/// `double`: IEEE-754, 8 bytes little-endian.
pub fn dump_double(v: f64) -> Vec<u8> { v.to_bytes() }
/// Inverse of [`dump_double`].
pub fn load_double(bytes: &[u8]) -> deserialize::Result<(f64, usize)> { load_with(bytes) }

/// `bytes`: length-prefixed, zero-padded to a multiple of 4.
/// Fails with [`EncodeError::TooLong`] past [`MAX_BYTES_LEN`](crate::serialize::MAX_BYTES_LEN).
pub fn dump_bytes(v: &[u8]) -> Result<Vec<u8>, EncodeError> {
    check_bytes_len(v.len())?;
    Ok(v.to_bytes())
}
/// Inverse of [`dump_bytes`]. Fails with [`Error::EmptyInput`] on an empty slice.
pub fn load_bytes(bytes: &[u8]) -> deserialize::Result<(Vec<u8>, usize)> { load_with(bytes) }

/// `string`: UTF-8 in `bytes` framing.
pub fn dump_string(v: &str) -> Result<Vec<u8>, EncodeError> { dump_bytes(v.as_bytes()) }
/// Inverse of [`dump_string`].
pub fn load_string(bytes: &[u8]) -> deserialize::Result<(String, usize)> { load_with(bytes) }

/// `Vector<T>` (boxed) or `vector<T>` (bare) using `dump_item` per element.
pub fn dump_vector<T>(dump_item: impl Fn(&T) -> Vec<u8>, items: &[T], bare: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if !bare {
        crate::VECTOR_ID.serialize(&mut out);
    }
    (items.len() as i32).serialize(&mut out);
    for item in items {
        out.extend(dump_item(item));
    }
    out
}

/// Inverse of [`dump_vector`]. In boxed mode the leading tag must be
/// `0x1cb5c415`.
pub fn load_vector<T>(
    load_item: impl Fn(&[u8]) -> deserialize::Result<(T, usize)>,
    bytes: &[u8],
    bare: bool,
) -> deserialize::Result<(Vec<T>, usize)> {
    let mut cur = Cursor::from_slice(bytes);
    if !bare {
        let id = u32::deserialize(&mut cur)?;
        if id != crate::VECTOR_ID {
            return Err(Error::BadVectorTag { id });
        }
    }
    let len = deserialize::read_len(&mut cur)?;
    let mut offset = cur.pos();
    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        let (item, used) = load_item(&bytes[offset..])?;
        offset += used;
        items.push(item);
    }
    Ok((items, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bytes_example() {
        assert_eq!(dump_bytes(&[1, 2, 3, 4]).unwrap(), vec![4, 1, 2, 3, 4, 0, 0, 0]);
        assert_eq!(load_bytes(&[4, 1, 2, 3, 4, 0, 0, 0]).unwrap(), (vec![1, 2, 3, 4], 8));
    }

    #[test]
    fn framing_boundary() {
        let short = dump_bytes(&[7u8; 253]).unwrap();
        assert_eq!(short.len(), 256);
        assert_eq!(short[0], 253);

        let long = dump_bytes(&[7u8; 254]).unwrap();
        assert_eq!(long.len(), 260);
        assert_eq!(&long[..4], &[0xfe, 254, 0, 0]);
        assert_eq!(load_bytes(&long).unwrap().1, 260);
    }

    #[test]
    fn oversized_bytes_are_refused() {
        let max = crate::serialize::MAX_BYTES_LEN;
        let long = dump_bytes(&vec![0u8; max]).unwrap();
        assert_eq!(&long[..4], &[0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(dump_bytes(&vec![0u8; max + 1]), Err(EncodeError::TooLong { len: max + 1, max }));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(load_bytes(&[]), Err(Error::EmptyInput));
    }

    #[test]
    fn consumed_offset_stops_at_value_end() {
        let mut buf = dump_string("hi").unwrap();
        buf.extend(dump_int(9));
        let (s, used) = load_string(&buf).unwrap();
        assert_eq!((s.as_str(), used), ("hi", 4));
        assert_eq!(load_int(&buf[used..]).unwrap(), (9, 4));
    }

    #[test]
    fn vector_layout() {
        let out = dump_vector(|v| dump_int(*v), &[2, 3, 4], false);
        assert_eq!(&out[..4], &0x1cb5c415u32.to_le_bytes());
        assert_eq!(&out[4..8], &3i32.to_le_bytes());
        assert_eq!(out.len(), 20);
        assert_eq!(load_vector(load_int, &out, false).unwrap(), (vec![2, 3, 4], 20));
    }

    #[test]
    fn vector_without_tag_is_rejected() {
        let bare = dump_vector(|v| dump_int(*v), &[2, 3, 4], true);
        assert!(matches!(load_vector(load_int, &bare, false), Err(Error::BadVectorTag { .. })));
        assert_eq!(load_vector(load_int, &bare, true).unwrap().0, vec![2, 3, 4]);
    }

    #[test]
    fn truncated_int() {
        assert_eq!(load_long(&[1, 2, 3]), Err(Error::UnexpectedEof));
    }
}
