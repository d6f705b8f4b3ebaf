//! The [`Serializable`] trait and its implementations for primitive TL types.
//!
//! Encoding follows the [MTProto Binary Serialization] rules.
//!
//! [MTProto Binary Serialization]: https://core.telegram.org/mtproto/serialize

use crate::engine::EncodeError;

/// Serialize `self` into TL binary format.
pub trait Serializable {
    /// Appends the serialized form of `self` to `buf`.
    fn serialize(&self, buf: &mut impl Extend<u8>);

    /// Convenience: allocate a fresh `Vec<u8>` and serialize into it.
    fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.serialize(&mut v);
        v
    }
}

// ─── bool ────────────────────────────────────────────────────────────────────

/// `true`  → `boolTrue#997275b5`
/// `false` → `boolFalse#bc799737`
impl Serializable for bool {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        let id = if *self { crate::BOOL_TRUE_ID } else { crate::BOOL_FALSE_ID };
        id.serialize(buf);
    }
}

// ─── integers ────────────────────────────────────────────────────────────────

macro_rules! le_int {
    ($($t:ty),*) => {$(
        impl Serializable for $t {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                buf.extend(self.to_le_bytes());
            }
        }
    )*};
}

le_int!(i32, u32, i64, u64, f64);

impl Serializable for [u8; 16] {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.iter().copied());
    }
}

impl Serializable for [u8; 32] {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.iter().copied());
    }
}

// ─── strings / bytes ─────────────────────────────────────────────────────────

/// Longest byte string the 3-byte length prefix can describe.
pub const MAX_BYTES_LEN: usize = 0xff_ffff;

/// TL byte-string framing, padded to a multiple of 4:
///
/// * `len ≤ 253`: `[len as u8][data][padding]`
/// * `len ≥ 254`: `[0xfe][len as 3 LE bytes][data][padding]`
///
/// Slices longer than [`MAX_BYTES_LEN`] cannot be framed; callers check
/// with [`check_bytes_len`] first.
impl Serializable for &[u8] {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        let len = self.len();
        let header_len = if len <= 253 {
            buf.extend([len as u8]);
            1
        } else {
            buf.extend([0xfe, (len & 0xff) as u8, ((len >> 8) & 0xff) as u8, ((len >> 16) & 0xff) as u8]);
            4
        };

        let padding = (4 - ((header_len + len) % 4)) % 4;
        buf.extend(self.iter().copied());
        buf.extend(std::iter::repeat_n(0u8, padding));
    }
}

/// Fails when `len` does not fit the byte-string length prefix.
pub fn check_bytes_len(len: usize) -> Result<(), EncodeError> {
    if len > MAX_BYTES_LEN {
        return Err(EncodeError::TooLong { len, max: MAX_BYTES_LEN });
    }
    Ok(())
}

impl Serializable for Vec<u8> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.as_slice().serialize(buf);
    }
}

impl Serializable for String {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.as_bytes().serialize(buf);
    }
}

impl Serializable for &str {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.as_bytes().serialize(buf);
    }
}

// ─── vectors ─────────────────────────────────────────────────────────────────

/// Boxed `Vector<T>`, prefixed with constructor ID `0x1cb5c415`.
impl<T: Serializable> Serializable for Vec<T> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        crate::VECTOR_ID.serialize(buf);
        (self.len() as i32).serialize(buf);
        for item in self { item.serialize(buf); }
    }
}

/// Bare `vector<T>`: a count followed by items, no constructor ID.
impl<T: Serializable> Serializable for crate::RawVec<T> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        (self.0.len() as i32).serialize(buf);
        for item in &self.0 { item.serialize(buf); }
    }
}

// ─── Option ──────────────────────────────────────────────────────────────────

/// Flag-guarded parameters: `None` writes nothing, the flags word carries
/// absence.
impl<T: Serializable> Serializable for Option<T> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        if let Some(v) = self { v.serialize(buf); }
    }
}
