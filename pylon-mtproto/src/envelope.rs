//! Unencrypted and encrypted message envelopes.
//!
//! Unencrypted (handshake only):
//!
//! ```text
//! auth_key_id = 0 (8) | msg_id (8) | length (4) | body
//! ```
//!
//! Encrypted:
//!
//! ```text
//! auth_key_id (8) | msg_key (16) | AES-IGE(
//!     salt (8) | session_id (8) | msg_id (8) | seq_no (4) | length (4) | body | padding
//! )
//! ```

use std::fmt;

use pylon_crypto::{AuthKey, DecryptError, Side, decrypt_data_v2, encrypt_data_v2};

/// Inner header size of an encrypted message.
const HEADER_LEN: usize = 32;
/// Padding bounds after the body of an encrypted message.
const MIN_PADDING: usize = 12;
const MAX_PADDING: usize = 1024;

/// Why an envelope could not be opened.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Shorter than the fixed header.
    TooShort { len: usize },
    /// An unencrypted envelope with a non-zero key id, or the reverse.
    WrongKind,
    /// The declared body length does not fit the buffer.
    BadLength { declared: i64, available: usize },
    /// Padding outside `12..=1024` bytes.
    BadPadding { len: usize },
    /// The crypto layer rejected the ciphertext.
    Crypto(DecryptError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "envelope too short: {len} bytes"),
            Self::WrongKind => write!(f, "unexpected auth_key_id for this envelope kind"),
            Self::BadLength { declared, available } => {
                write!(f, "declared body length {declared} exceeds the {available} bytes available")
            }
            Self::BadPadding { len } => write!(f, "invalid padding length {len}"),
            Self::Crypto(e) => write!(f, "crypto: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<DecryptError> for Error {
    fn from(e: DecryptError) -> Self {
        Self::Crypto(e)
    }
}

/// Whether `frame` is unencrypted: its first 8 bytes are zero.
pub fn is_plain(frame: &[u8]) -> bool {
    frame.len() >= 8 && frame[..8].iter().all(|&b| b == 0)
}

/// The `auth_key_id` a frame starts with.
pub fn auth_key_id(frame: &[u8]) -> Result<u64, Error> {
    let head = frame.get(..8).ok_or(Error::TooShort { len: frame.len() })?;
    let mut id = [0u8; 8];
    id.copy_from_slice(head);
    Ok(u64::from_le_bytes(id))
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(b)
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    i32::from_le_bytes(b)
}

/// An unencrypted handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlainMessage {
    pub msg_id: i64,
    pub body: Vec<u8>,
}

impl PlainMessage {
    pub fn new(msg_id: i64, body: Vec<u8>) -> Self {
        Self { msg_id, body }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.body.len());
        buf.extend(0u64.to_le_bytes());
        buf.extend(self.msg_id.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn from_bytes(frame: &[u8]) -> Result<Self, Error> {
        if frame.len() < 20 {
            return Err(Error::TooShort { len: frame.len() });
        }
        if !is_plain(frame) {
            return Err(Error::WrongKind);
        }
        let msg_id = read_i64(frame, 8);
        let len = read_i32(frame, 16);
        let available = frame.len() - 20;
        if len < 0 || len as usize > available {
            return Err(Error::BadLength { declared: len as i64, available });
        }
        Ok(Self { msg_id, body: frame[20..20 + len as usize].to_vec() })
    }
}

/// The decrypted contents of an encrypted message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub salt: i64,
    pub session_id: i64,
    pub msg_id: i64,
    pub seq_no: i32,
    /// TL-serialized body.
    pub body: Vec<u8>,
}

impl EncryptedMessage {
    /// Encrypts the message as produced by `side`.
    pub fn encrypt(&self, auth_key: &AuthKey, side: Side) -> Vec<u8> {
        let mut plain = Vec::with_capacity(HEADER_LEN + self.body.len());
        plain.extend(self.salt.to_le_bytes());
        plain.extend(self.session_id.to_le_bytes());
        plain.extend(self.msg_id.to_le_bytes());
        plain.extend(self.seq_no.to_le_bytes());
        plain.extend((self.body.len() as u32).to_le_bytes());
        plain.extend_from_slice(&self.body);
        encrypt_data_v2(&plain, auth_key, side)
    }

    /// Decrypts a frame that `side` produced with `auth_key`.
    pub fn decrypt(frame: &[u8], auth_key: &AuthKey, side: Side) -> Result<Self, Error> {
        let mut buffer = frame.to_vec();
        let plain = decrypt_data_v2(&mut buffer, auth_key, side)?;
        Self::parse(plain)
    }

    fn parse(plain: &[u8]) -> Result<Self, Error> {
        if plain.len() < HEADER_LEN {
            return Err(Error::TooShort { len: plain.len() });
        }
        let len = read_i32(plain, 28);
        let available = plain.len() - HEADER_LEN;
        if len < 0 || len % 4 != 0 || len as usize > available {
            return Err(Error::BadLength { declared: len as i64, available });
        }
        let padding = available - len as usize;
        if !(MIN_PADDING..=MAX_PADDING).contains(&padding) {
            return Err(Error::BadPadding { len: padding });
        }
        Ok(Self {
            salt: read_i64(plain, 0),
            session_id: read_i64(plain, 8),
            msg_id: read_i64(plain, 16),
            seq_no: read_i32(plain, 24),
            body: plain[HEADER_LEN..HEADER_LEN + len as usize].to_vec(),
        })
    }
}
