//! The [`Deserializable`] trait, [`Cursor`] buffer, and primitive impls.

use std::fmt;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur while decoding TL.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Ran out of bytes before the value was fully read.
    UnexpectedEof,
    /// A byte string was requested from an empty buffer.
    EmptyInput,
    /// A boxed vector did not start with `0x1cb5c415`.
    BadVectorTag { id: u32 },
    /// Decoded an id that doesn't match any known or expected constructor.
    UnexpectedConstructor { id: u32 },
    /// A `string` was not valid UTF-8.
    InvalidUtf8,
    /// A vector announced a negative element count.
    InvalidLength { len: i32 },
    /// A vector appeared where the element type is not known.
    UntypedVector,
    /// Every candidate schema rejected the input.
    NoMatchingSchema { attempts: Vec<Error> },
    /// A custom loader rejected the input.
    Custom(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::EmptyInput => write!(f, "empty input"),
            Self::BadVectorTag { id } => write!(f, "bad vector tag: {id:#010x}"),
            Self::UnexpectedConstructor { id } => {
                write!(f, "unexpected constructor id: {id:#010x}")
            }
            Self::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Self::InvalidLength { len } => write!(f, "invalid vector length: {len}"),
            Self::UntypedVector => write!(f, "vector without a known element type"),
            Self::NoMatchingSchema { attempts } => {
                write!(f, "no schema could decode the input")?;
                for (i, e) in attempts.iter().enumerate() {
                    write!(f, "; #{i}: {e}")?;
                }
                Ok(())
            }
            Self::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for deserialization.
pub type Result<T> = std::result::Result<T, Error>;

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// A zero-copy cursor over an in-memory byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn pos(&self) -> usize { self.pos }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize { self.buf.len() - self.pos }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        match self.buf.get(self.pos).copied() {
            Some(b) => { self.pos += 1; Ok(b) }
            None    => Err(Error::UnexpectedEof),
        }
    }

    /// Read exactly `out.len()` bytes.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let end = self.pos + out.len();
        if end > self.buf.len() {
            return Err(Error::UnexpectedEof);
        }
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    /// Borrow the next `len` bytes and advance past them.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(Error::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    /// Look at the next 4 bytes as a little-endian `u32` without consuming.
    pub fn peek_u32(&self) -> Result<u32> {
        let b = self.buf.get(self.pos..self.pos + 4).ok_or(Error::UnexpectedEof)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Consume all remaining bytes into `out`.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> usize {
        let slice = &self.buf[self.pos..];
        out.extend_from_slice(slice);
        self.pos = self.buf.len();
        slice.len()
    }
}

/// Shorthand for the cursor argument of [`Deserializable::deserialize`].
pub type Buffer<'a, 'b> = &'a mut Cursor<'b>;

// ─── Deserializable ──────────────────────────────────────────────────────────

/// Deserialize a value from TL binary format.
pub trait Deserializable: Sized {
    /// Read `Self` from `buf`, advancing its position.
    fn deserialize(buf: Buffer) -> Result<Self>;

    /// Convenience: deserialize from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::from_slice(bytes);
        Self::deserialize(&mut cursor)
    }
}

// ─── Primitives ───────────────────────────────────────────────────────────────

impl Deserializable for bool {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            crate::BOOL_TRUE_ID => Ok(true),
            crate::BOOL_FALSE_ID => Ok(false),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

macro_rules! le_int {
    ($($t:ty),*) => {$(
        impl Deserializable for $t {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let mut b = [0u8; std::mem::size_of::<$t>()];
                buf.read_exact(&mut b)?;
                Ok(<$t>::from_le_bytes(b))
            }
        }
    )*};
}

le_int!(i32, u32, i64, u64, f64);

impl Deserializable for [u8; 16] {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let mut b = [0u8; 16];
        buf.read_exact(&mut b)?;
        Ok(b)
    }
}

impl Deserializable for [u8; 32] {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let mut b = [0u8; 32];
        buf.read_exact(&mut b)?;
        Ok(b)
    }
}

// ─── Bytes / String ───────────────────────────────────────────────────────────

impl Deserializable for Vec<u8> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        if buf.remaining() == 0 {
            return Err(Error::EmptyInput);
        }
        let first = buf.read_byte()?;
        let (len, header_len) = if first != 0xfe {
            (first as usize, 1)
        } else {
            let a = buf.read_byte()? as usize;
            let b = buf.read_byte()? as usize;
            let c = buf.read_byte()? as usize;
            (a | (b << 8) | (c << 16), 4)
        };

        let data = buf.read_slice(len)?.to_vec();

        let padding = (4 - ((header_len + len) % 4)) % 4;
        buf.read_slice(padding)?;

        Ok(data)
    }
}

impl Deserializable for String {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let bytes = Vec::<u8>::deserialize(buf)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }
}

// ─── Vectors ─────────────────────────────────────────────────────────────────

/// Reads a vector element count, rejecting negative values.
pub(crate) fn read_len(buf: Buffer) -> Result<usize> {
    let len = i32::deserialize(buf)?;
    usize::try_from(len).map_err(|_| Error::InvalidLength { len })
}

impl<T: Deserializable> Deserializable for Vec<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != crate::VECTOR_ID {
            return Err(Error::BadVectorTag { id });
        }
        let len = read_len(buf)?;
        (0..len).map(|_| T::deserialize(buf)).collect()
    }
}

impl<T: Deserializable> Deserializable for crate::RawVec<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let len = read_len(buf)?;
        let inner = (0..len).map(|_| T::deserialize(buf)).collect::<Result<_>>()?;
        Ok(crate::RawVec(inner))
    }
}
