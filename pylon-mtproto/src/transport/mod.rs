//! Length-prefix framing over any tokio byte stream.
//!
//! The server calls [`accept`] on a fresh connection: the first bytes pick
//! the framing (abridged, intermediate, full, or an obfuscated header
//! carrying abridged/intermediate), after which a [`FrameReader`] and a
//! [`FrameWriter`] move whole MTProto packets. Clients use [`connect`].
//!
//! Every error here means the byte stream can no longer be trusted and the
//! connection should be closed.

use std::fmt;
use std::io;

use pylon_crypto::aes::AesCtr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod obfuscated;

/// Largest frame accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Transport error code sent to a client whose auth key is unknown.
pub const AUTH_KEY_NOT_FOUND: i32 = -404;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// The obfuscation header decrypted to an unknown framing tag.
    UnknownTag { tag: u32 },
    /// A framing this implementation does not speak in the requested mode.
    UnsupportedFraming { tag: u32 },
    FrameTooLarge { len: usize, max: usize },
    /// The frame length is not a whole number of 32-bit words.
    BadLength { len: usize },
    BadChecksum { expected: u32, got: u32 },
    BadSequence { expected: u32, got: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport I/O: {e}"),
            Self::UnknownTag { tag } => write!(f, "unknown transport tag {tag:#010x}"),
            Self::UnsupportedFraming { tag } => write!(f, "unsupported transport framing {tag:#010x}"),
            Self::FrameTooLarge { len, max } => write!(f, "frame of {len} bytes exceeds {max}"),
            Self::BadLength { len } => write!(f, "frame length {len} is not a multiple of 4"),
            Self::BadChecksum { expected, got } => {
                write!(f, "CRC mismatch (got {got:#010x}, expected {expected:#010x})")
            }
            Self::BadSequence { expected, got } => write!(f, "frame seq {got} (expected {expected})"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// ─── Framing ─────────────────────────────────────────────────────────────────

/// How packets are delimited on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// One length byte counting words, or `0x7f` and three more.
    Abridged,
    /// Four-byte little-endian byte length.
    Intermediate,
    /// Length, sequence number, payload and CRC32.
    Full,
}

/// A 4-byte packet is a transport error code rather than a message.
pub fn transport_error(frame: &[u8]) -> Option<i32> {
    <[u8; 4]>::try_from(frame).ok().map(i32::from_le_bytes)
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Reads whole frames, decrypting first when the connection is obfuscated.
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    cipher: Option<AesCtr>,
    /// Bytes consumed during detection that belong to the first frame.
    pending: Vec<u8>,
    max_len: usize,
    seq: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing, cipher: Option<AesCtr>) -> Self {
        Self { inner, framing, cipher, pending: Vec::new(), max_len: DEFAULT_MAX_FRAME_LEN, seq: 0 }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn is_obfuscated(&self) -> bool {
        self.cipher.is_some()
    }

    async fn fill(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let from_pending = self.pending.len().min(buf.len());
        buf[..from_pending].copy_from_slice(&self.pending[..from_pending]);
        self.pending = self.pending.split_off(from_pending);
        if from_pending < buf.len() {
            self.inner.read_exact(&mut buf[from_pending..]).await?;
        }
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(buf);
        }
        Ok(())
    }

    /// Reads the first byte of a frame; `None` on a clean end of stream.
    async fn first_byte(&mut self) -> io::Result<Option<u8>> {
        if self.pending.is_empty() {
            let mut b = [0u8; 1];
            if self.inner.read(&mut b).await? == 0 {
                return Ok(None);
            }
            self.pending.push(b[0]);
        }
        let mut b = [0u8; 1];
        self.fill(&mut b).await?;
        Ok(Some(b[0]))
    }

    fn check_len(&self, len: usize) -> Result<(), Error> {
        if len > self.max_len {
            return Err(Error::FrameTooLarge { len, max: self.max_len });
        }
        if len % 4 != 0 {
            return Err(Error::BadLength { len });
        }
        Ok(())
    }

    /// The next packet, or `None` once the peer closed between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let Some(first) = self.first_byte().await? else {
            return Ok(None);
        };
        let payload = match self.framing {
            Framing::Abridged => {
                // The high bit asks for a quick ack, which is not sent.
                let words = match first & 0x7f {
                    0x7f => {
                        let mut b = [0u8; 3];
                        self.fill(&mut b).await?;
                        u32::from_le_bytes([b[0], b[1], b[2], 0]) as usize
                    }
                    n => n as usize,
                };
                let len = words * 4;
                self.check_len(len)?;
                let mut buf = vec![0u8; len];
                self.fill(&mut buf).await?;
                buf
            }
            Framing::Intermediate => {
                let mut rest = [0u8; 3];
                self.fill(&mut rest).await?;
                let len = (u32::from_le_bytes([first, rest[0], rest[1], rest[2]]) & 0x7fff_ffff) as usize;
                self.check_len(len)?;
                let mut buf = vec![0u8; len];
                self.fill(&mut buf).await?;
                buf
            }
            Framing::Full => {
                let mut rest = [0u8; 3];
                self.fill(&mut rest).await?;
                let len_bytes = [first, rest[0], rest[1], rest[2]];
                let total = u32::from_le_bytes(len_bytes) as usize;
                if total < 12 {
                    return Err(Error::BadLength { len: total });
                }
                self.check_len(total - 12)?;
                let mut body = vec![0u8; total - 4];
                self.fill(&mut body).await?;

                let (covered, crc) = body.split_at(total - 8);
                let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
                let mut input = Vec::with_capacity(total - 4);
                input.extend_from_slice(&len_bytes);
                input.extend_from_slice(covered);
                let got = pylon_tl_parser::crc32(&input);
                if got != expected {
                    return Err(Error::BadChecksum { expected, got });
                }
                let seq = u32::from_le_bytes([covered[0], covered[1], covered[2], covered[3]]);
                if seq != self.seq {
                    return Err(Error::BadSequence { expected: self.seq, got: seq });
                }
                self.seq = self.seq.wrapping_add(1);
                covered[4..].to_vec()
            }
        };
        Ok(Some(payload))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Writes whole frames, encrypting last when the connection is obfuscated.
pub struct FrameWriter<W> {
    inner: W,
    framing: Framing,
    cipher: Option<AesCtr>,
    seq: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, framing: Framing, cipher: Option<AesCtr>) -> Self {
        Self { inner, framing, cipher, seq: 0 }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Frames `payload` in one buffer so a frame is never split between
    /// writes.
    pub fn encode(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if payload.len() % 4 != 0 {
            return Err(Error::BadLength { len: payload.len() });
        }
        let mut packet = Vec::with_capacity(payload.len() + 12);
        match self.framing {
            Framing::Abridged => {
                let words = payload.len() / 4;
                if words < 0x7f {
                    packet.push(words as u8);
                } else {
                    packet.push(0x7f);
                    packet.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
                }
                packet.extend_from_slice(payload);
            }
            Framing::Intermediate => {
                packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                packet.extend_from_slice(payload);
            }
            Framing::Full => {
                packet.extend_from_slice(&((payload.len() + 12) as u32).to_le_bytes());
                packet.extend_from_slice(&self.seq.to_le_bytes());
                packet.extend_from_slice(payload);
                let crc = pylon_tl_parser::crc32(&packet);
                packet.extend_from_slice(&crc.to_le_bytes());
                self.seq = self.seq.wrapping_add(1);
            }
        }
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut packet);
        }
        Ok(packet)
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        let packet = self.encode(payload)?;
        self.inner.write_all(&packet).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Sends a transport error code such as [`AUTH_KEY_NOT_FOUND`].
    pub async fn write_transport_error(&mut self, code: i32) -> Result<(), Error> {
        self.write_frame(&code.to_le_bytes()).await
    }

    /// Writes bytes that bypass framing and encryption.
    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

// ─── Handshakes ──────────────────────────────────────────────────────────────

/// What a server accepts on new connections.
#[derive(Clone, Debug)]
pub struct AcceptOptions {
    /// Secret mixed into obfuscation keys, if any.
    pub secret: Option<[u8; 16]>,
    pub max_frame_len: usize,
}

impl Default for AcceptOptions {
    fn default() -> Self {
        Self { secret: None, max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }
}

/// Detects the framing from the first bytes a client sends.
pub async fn accept<R, W>(
    mut reader: R,
    writer: W,
    options: &AcceptOptions,
) -> Result<(FrameReader<R>, FrameWriter<W>), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut head = [0u8; obfuscated::HEADER_LEN];
    reader.read_exact(&mut head[..1]).await?;
    if head[0] == 0xef {
        log::debug!("[transport] abridged");
        return Ok(plain(reader, writer, Framing::Abridged, Vec::new(), options));
    }

    reader.read_exact(&mut head[1..4]).await?;
    if head[..4] == [0xee; 4] {
        log::debug!("[transport] intermediate");
        return Ok(plain(reader, writer, Framing::Intermediate, Vec::new(), options));
    }

    reader.read_exact(&mut head[4..8]).await?;
    if head[4..8] == [0; 4] {
        log::debug!("[transport] full");
        return Ok(plain(reader, writer, Framing::Full, head[..8].to_vec(), options));
    }

    reader.read_exact(&mut head[8..]).await?;
    let (framing, ciphers) = obfuscated::accept_header(&head, options.secret.as_ref())?;
    log::debug!("[transport] obfuscated {framing:?}");
    let reader = FrameReader::new(reader, framing, Some(ciphers.decrypt)).with_max_len(options.max_frame_len);
    let writer = FrameWriter::new(writer, framing, Some(ciphers.encrypt));
    Ok((reader, writer))
}

fn plain<R, W>(
    reader: R,
    writer: W,
    framing: Framing,
    pending: Vec<u8>,
    options: &AcceptOptions,
) -> (FrameReader<R>, FrameWriter<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader, framing, None).with_max_len(options.max_frame_len);
    reader.pending = pending;
    (reader, FrameWriter::new(writer, framing, None))
}

/// How a client opens a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientMode {
    Plain(Framing),
    Obfuscated { framing: Framing, secret: Option<[u8; 16]> },
}

/// Sends the connection preamble for `mode`.
pub async fn connect<R, W>(reader: R, writer: W, mode: ClientMode) -> Result<(FrameReader<R>, FrameWriter<W>), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match mode {
        ClientMode::Plain(framing) => {
            let mut writer = FrameWriter::new(writer, framing, None);
            match framing {
                Framing::Abridged => writer.write_raw(&[0xef]).await?,
                Framing::Intermediate => writer.write_raw(&[0xee; 4]).await?,
                Framing::Full => {}
            }
            Ok((FrameReader::new(reader, framing, None), writer))
        }
        ClientMode::Obfuscated { framing, secret } => {
            let (header, ciphers) = obfuscated::client_header(framing, secret.as_ref())?;
            let mut writer = FrameWriter::new(writer, framing, Some(ciphers.encrypt));
            writer.write_raw(&header).await?;
            Ok((FrameReader::new(reader, framing, Some(ciphers.decrypt)), writer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abridged_length_prefix() {
        let mut writer = FrameWriter::new(Vec::new(), Framing::Abridged, None);
        assert_eq!(writer.encode(&[1; 8]).unwrap()[0], 2);

        let long = writer.encode(&vec![0; 0x7f * 4]).unwrap();
        assert_eq!(&long[..4], &[0x7f, 0x7f, 0, 0]);
        assert_eq!(long.len(), 4 + 0x7f * 4);
    }

    #[test]
    fn full_frames_carry_seq_and_crc() {
        let mut writer = FrameWriter::new(Vec::new(), Framing::Full, None);
        let first = writer.encode(&[0xaa; 4]).unwrap();
        let second = writer.encode(&[0xaa; 4]).unwrap();
        assert_eq!(&first[..4], &16u32.to_le_bytes());
        assert_eq!(&first[4..8], &0u32.to_le_bytes());
        assert_eq!(&second[4..8], &1u32.to_le_bytes());
        let crc = pylon_tl_parser::crc32(&first[..12]);
        assert_eq!(&first[12..], &crc.to_le_bytes());
    }

    #[test]
    fn unaligned_payloads_are_refused() {
        let mut writer = FrameWriter::new(Vec::new(), Framing::Intermediate, None);
        assert!(matches!(writer.encode(&[0; 5]), Err(Error::BadLength { len: 5 })));
    }

    #[test]
    fn transport_error_codes() {
        assert_eq!(transport_error(&(-404i32).to_le_bytes()), Some(-404));
        assert_eq!(transport_error(&[0; 8]), None);
    }

    #[tokio::test]
    async fn reader_enforces_max_len() {
        let mut wire = vec![0xee; 4];
        wire.extend_from_slice(&64u32.to_le_bytes());
        wire.extend_from_slice(&[0; 64]);
        let options = AcceptOptions { secret: None, max_frame_len: 32 };
        let (mut reader, _) = accept(&wire[..], Vec::new(), &options).await.unwrap();
        assert!(matches!(reader.read_frame().await, Err(Error::FrameTooLarge { len: 64, max: 32 })));
    }

    #[tokio::test]
    async fn full_detection_keeps_the_first_frame() {
        let mut writer = FrameWriter::new(Vec::new(), Framing::Full, None);
        let mut wire = writer.encode(&[1, 2, 3, 4]).unwrap();
        wire.extend(writer.encode(&[5, 6, 7, 8]).unwrap());

        let (mut reader, _) = accept(&wire[..], Vec::new(), &AcceptOptions::default()).await.unwrap();
        assert_eq!(reader.framing(), Framing::Full);
        assert_eq!(reader.read_frame().await.unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(reader.read_frame().await.unwrap(), Some(vec![5, 6, 7, 8]));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }
}
