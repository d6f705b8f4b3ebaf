//! Textbook RSA as the MTProto handshake uses it: raw modular
//! exponentiation, the RSA_PAD wrapping, key fingerprints and PKCS#1
//! public key encoding.

use std::fmt;

use base64::Engine as _;
use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::{aes, prime, sha1, sha256};

/// Bytes of payload RSA_PAD can carry.
pub const MAX_PADDED_DATA: usize = 144;

/// Modulus width, in bytes, of keys usable in the key exchange.
pub const HANDSHAKE_KEY_SIZE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A component failed to parse, or the modulus is unusable.
    InvalidKey,
    /// The input does not fit the operation.
    MessageTooLong { len: usize, max: usize },
    /// The input, read as an integer, is not below the modulus.
    OutOfRange,
    /// The RSA_PAD integrity hash did not match.
    HashMismatch,
    /// Malformed PEM armour or DER body.
    InvalidPem(String),
    /// Key generation was asked for an unsupported size.
    Generation { bits: u64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "invalid RSA key"),
            Self::MessageTooLong { len, max } => {
                write!(f, "RSA input of {len} bytes exceeds {max}")
            }
            Self::OutOfRange => write!(f, "RSA input is not below the modulus"),
            Self::HashMismatch => write!(f, "RSA_PAD hash mismatch"),
            Self::InvalidPem(msg) => write!(f, "invalid PEM: {msg}"),
            Self::Generation { bits } => write!(f, "cannot generate a {bits}-bit RSA key"),
        }
    }
}

impl std::error::Error for Error {}

/// An RSA public key `(n, e)`.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    n: BigUint,
    e: BigUint,
}

impl PublicKey {
    /// Parse decimal `n` and `e` strings.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Some(Self {
            n: BigUint::parse_bytes(n.as_bytes(), 10)?,
            e: BigUint::parse_bytes(e.as_bytes(), 10)?,
        })
    }

    pub fn from_parts(n: BigUint, e: BigUint) -> Self {
        Self { n, e }
    }

    pub fn n(&self) -> &BigUint {
        &self.n
    }

    pub fn e(&self) -> &BigUint {
        &self.e
    }

    /// Width of the modulus in bytes.
    pub fn size(&self) -> usize {
        self.n.bits().div_ceil(8) as usize
    }

    /// Low 64 bits (little-endian) of `SHA1(bytes(n) ‖ bytes(e))`, where
    /// `bytes` is the TL byte-string framing of the big-endian integers.
    pub fn fingerprint(&self) -> i64 {
        let mut buf = Vec::with_capacity(self.size() + 16);
        tl_bytes(&self.n.to_bytes_be(), &mut buf);
        tl_bytes(&self.e.to_bytes_be(), &mut buf);
        let sha = sha1!(&buf);
        let mut low = [0u8; 8];
        low.copy_from_slice(&sha[12..20]);
        i64::from_le_bytes(low)
    }

    /// `data^e mod n`, left-padded to [`size`](Self::size) bytes.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let m = BigUint::from_bytes_be(data);
        if m >= self.n {
            return Err(Error::OutOfRange);
        }
        Ok(left_pad(&m.modpow(&self.e, &self.n), self.size()))
    }

    /// DER `RSAPublicKey ::= SEQUENCE { modulus INTEGER, publicExponent INTEGER }`.
    pub fn to_pkcs1_der(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.size() + 16);
        der_uint(&self.n, &mut body);
        der_uint(&self.e, &mut body);
        let mut out = Vec::with_capacity(body.len() + 4);
        out.push(TAG_SEQUENCE);
        der_len(body.len(), &mut out);
        out.extend_from_slice(&body);
        out
    }

    pub fn to_pkcs1_pem(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(self.to_pkcs1_der());
        let mut out = String::from("-----BEGIN RSA PUBLIC KEY-----\n");
        for line in encoded.as_bytes().chunks(64) {
            out.push_str(&String::from_utf8_lossy(line));
            out.push('\n');
        }
        out.push_str("-----END RSA PUBLIC KEY-----\n");
        out
    }

    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self, Error> {
        let mut outer = Der(der);
        let mut seq = Der(outer.read(TAG_SEQUENCE)?);
        let n = BigUint::from_bytes_be(seq.read(TAG_INTEGER)?);
        let e = BigUint::from_bytes_be(seq.read(TAG_INTEGER)?);
        if n.is_zero() || e.is_zero() {
            return Err(Error::InvalidKey);
        }
        Ok(Self { n, e })
    }

    pub fn from_pkcs1_pem(pem: &str) -> Result<Self, Error> {
        let body: String = pem
            .lines()
            .map(str::trim)
            .skip_while(|l| !l.starts_with("-----BEGIN RSA PUBLIC KEY-----"))
            .skip(1)
            .take_while(|l| !l.starts_with("-----END"))
            .collect();
        if body.is_empty() {
            return Err(Error::InvalidPem("missing RSA PUBLIC KEY block".into()));
        }
        let der = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|e| Error::InvalidPem(e.to_string()))?;
        Self::from_pkcs1_der(&der)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("bits", &self.n.bits())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// A public key with its private exponent.
#[derive(Clone, PartialEq, Eq)]
pub struct RsaKeyPair {
    public: PublicKey,
    d: BigUint,
}

impl RsaKeyPair {
    /// Parse decimal `n`, `e` and `d`.
    pub fn new(n: &str, e: &str, d: &str) -> Result<Self, Error> {
        let public = PublicKey::new(n, e).ok_or(Error::InvalidKey)?;
        let d = BigUint::parse_bytes(d.as_bytes(), 10).ok_or(Error::InvalidKey)?;
        Self::from_parts(public, d)
    }

    pub fn from_parts(public: PublicKey, d: BigUint) -> Result<Self, Error> {
        if public.n <= BigUint::one() || d.is_zero() || d >= public.n {
            return Err(Error::InvalidKey);
        }
        Ok(Self { public, d })
    }

    /// A fresh key with a `bits`-wide modulus and `e = 65537`.
    ///
    /// Meant for development setups; production keys should be generated
    /// offline and loaded from configuration.
    pub fn generate(bits: u64) -> Result<Self, Error> {
        if bits < 512 || bits % 2 != 0 {
            return Err(Error::Generation { bits });
        }
        let e = BigUint::from(65537u32);
        loop {
            let p = prime::generate_prime(bits / 2).ok_or(Error::Generation { bits })?;
            let q = prime::generate_prime(bits / 2).ok_or(Error::Generation { bits })?;
            if p == q {
                continue;
            }
            let phi = (&p - BigUint::one()) * (&q - BigUint::one());
            let Some(d) = e.modinv(&phi) else { continue };
            return Self::from_parts(PublicKey::from_parts(p * q, e), d);
        }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn fingerprint(&self) -> i64 {
        self.public.fingerprint()
    }

    /// `data^d mod n`, left-padded to the modulus width.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let size = self.public.size();
        if data.len() > size {
            return Err(Error::MessageTooLong { len: data.len(), max: size });
        }
        let c = BigUint::from_bytes_be(data);
        if c >= self.public.n {
            return Err(Error::OutOfRange);
        }
        Ok(left_pad(&c.modpow(&self.d, &self.public.n), size))
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

fn left_pad(value: &BigUint, size: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    let mut out = vec![0u8; size.saturating_sub(raw.len())];
    out.extend_from_slice(&raw);
    out
}

fn tl_bytes(data: &[u8], out: &mut Vec<u8>) {
    let start = out.len();
    if data.len() <= 253 {
        out.push(data.len() as u8);
    } else {
        out.push(254);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes()[..3]);
    }
    out.extend_from_slice(data);
    while (out.len() - start) % 4 != 0 {
        out.push(0);
    }
}

fn increment(data: &mut [u8]) {
    for byte in data.iter_mut().rev() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
}

/// RSA_PAD: wrap up to 144 bytes of `data` for a 2048-bit `key`.
///
/// `random_bytes` supplies the 192-byte padding (first part) and the
/// 32-byte temporary AES key (last part).
pub fn encrypt_hashed(data: &[u8], key: &PublicKey, random_bytes: &[u8; 224]) -> Result<Vec<u8>, Error> {
    if data.len() > MAX_PADDED_DATA {
        return Err(Error::MessageTooLong { len: data.len(), max: MAX_PADDED_DATA });
    }
    if key.size() != HANDSHAKE_KEY_SIZE {
        return Err(Error::InvalidKey);
    }

    let mut data_with_padding = Vec::with_capacity(192);
    data_with_padding.extend_from_slice(data);
    data_with_padding.extend_from_slice(&random_bytes[..192 - data.len()]);
    let data_pad_reversed: Vec<u8> = data_with_padding.iter().rev().copied().collect();

    let mut temp_key = [0u8; 32];
    temp_key.copy_from_slice(&random_bytes[192..]);

    loop {
        let mut data_with_hash = Vec::with_capacity(224);
        data_with_hash.extend_from_slice(&data_pad_reversed);
        data_with_hash.extend_from_slice(&sha256!(&temp_key, &data_with_padding));
        aes::ige_encrypt(&mut data_with_hash, &temp_key, &[0u8; 32]);

        let mut key_aes_encrypted = temp_key.to_vec();
        for (k, h) in key_aes_encrypted.iter_mut().zip(sha256!(&data_with_hash)) {
            *k ^= h;
        }
        key_aes_encrypted.extend_from_slice(&data_with_hash);

        // Retry with another temporary key until the block fits below n.
        match key.encrypt(&key_aes_encrypted) {
            Err(Error::OutOfRange) => increment(&mut temp_key),
            other => return other,
        }
    }
}

/// Undo [`encrypt_hashed`], returning the 192-byte `data_with_padding`.
/// The caller knows how much of it is payload.
pub fn decrypt_hashed(encrypted: &[u8], key: &RsaKeyPair) -> Result<Vec<u8>, Error> {
    if key.public.size() != HANDSHAKE_KEY_SIZE {
        return Err(Error::InvalidKey);
    }
    unwrap_hashed(&key.decrypt(encrypted)?)
}

/// The symmetric half of [`decrypt_hashed`], for a block that has already
/// been through [`RsaKeyPair::decrypt`].
pub fn unwrap_hashed(key_aes_encrypted: &[u8]) -> Result<Vec<u8>, Error> {
    if key_aes_encrypted.len() != HANDSHAKE_KEY_SIZE {
        return Err(Error::MessageTooLong { len: key_aes_encrypted.len(), max: HANDSHAKE_KEY_SIZE });
    }
    let (temp_key_xor, aes_encrypted) = key_aes_encrypted.split_at(32);

    let mut temp_key = [0u8; 32];
    for ((t, x), h) in temp_key.iter_mut().zip(temp_key_xor).zip(sha256!(aes_encrypted)) {
        *t = x ^ h;
    }

    let mut data_with_hash = aes_encrypted.to_vec();
    aes::ige_decrypt(&mut data_with_hash, &temp_key, &[0u8; 32]);
    let (data_pad_reversed, hash) = data_with_hash.split_at(192);

    let data_with_padding: Vec<u8> = data_pad_reversed.iter().rev().copied().collect();
    if sha256!(&temp_key, &data_with_padding) != hash {
        return Err(Error::HashMismatch);
    }
    Ok(data_with_padding)
}

const TAG_INTEGER: u8 = 0x02;
const TAG_SEQUENCE: u8 = 0x30;

fn der_len(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

fn der_uint(value: &BigUint, out: &mut Vec<u8>) {
    let mut raw = value.to_bytes_be();
    if raw[0] & 0x80 != 0 {
        raw.insert(0, 0);
    }
    out.push(TAG_INTEGER);
    der_len(raw.len(), out);
    out.extend_from_slice(&raw);
}

/// Minimal DER reader covering the two tags a PKCS#1 public key uses.
struct Der<'a>(&'a [u8]);

impl<'a> Der<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.0.len() < n {
            return Err(Error::InvalidPem("truncated DER".into()));
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn read(&mut self, tag: u8) -> Result<&'a [u8], Error> {
        let found = self.take(1)?[0];
        if found != tag {
            return Err(Error::InvalidPem(format!("expected DER tag {tag:#04x}, found {found:#04x}")));
        }
        let first = self.take(1)?[0];
        let len = if first < 0x80 {
            first as usize
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 || count > 4 {
                return Err(Error::InvalidPem("unsupported DER length".into()));
            }
            self.take(count)?.iter().fold(0usize, |acc, &b| acc << 8 | b as usize)
        };
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCTION_N: &str = "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323";

    fn test_pair() -> RsaKeyPair {
        let text = include_str!("../../testdata/rsa_2048.txt");
        let mut parts = text.split_whitespace();
        RsaKeyPair::new(parts.next().unwrap(), parts.next().unwrap(), parts.next().unwrap()).unwrap()
    }

    #[test]
    fn production_fingerprint() {
        let key = PublicKey::new(PRODUCTION_N, "65537").unwrap();
        assert_eq!(key.fingerprint(), -3414540481677951611);
        assert_eq!(key.size(), 256);
    }

    #[test]
    fn fixture_fingerprint() {
        assert_eq!(test_pair().fingerprint(), 6472784225858385840);
    }

    #[test]
    fn textbook_round_trip() {
        let pair = test_pair();
        let message = b"not a real handshake payload";
        let encrypted = pair.public().encrypt(message).unwrap();
        assert_eq!(encrypted.len(), 256);
        let decrypted = pair.decrypt(&encrypted).unwrap();
        assert_eq!(&decrypted[256 - message.len()..], message);
        assert!(decrypted[..256 - message.len()].iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_input() {
        let pair = test_pair();
        assert_eq!(pair.public().encrypt(&[0xff; 256]), Err(Error::OutOfRange));
        assert!(matches!(pair.decrypt(&[1; 300]), Err(Error::MessageTooLong { .. })));
    }

    #[test]
    fn rsa_pad_round_trip() {
        let pair = test_pair();
        let data: Vec<u8> = (0..100u8).collect();
        let random: [u8; 224] = std::array::from_fn(|i| (i * 31 % 251) as u8);

        let encrypted = encrypt_hashed(&data, pair.public(), &random).unwrap();
        let recovered = decrypt_hashed(&encrypted, &pair).unwrap();
        assert_eq!(recovered.len(), 192);
        assert_eq!(&recovered[..100], &data[..]);
        assert_eq!(&recovered[100..], &random[..92]);
    }

    #[test]
    fn rsa_pad_rejects_tampering() {
        let pair = test_pair();
        let random = [7u8; 224];
        let encrypted = encrypt_hashed(b"payload", pair.public(), &random).unwrap();
        // Re-encrypt a tweaked plaintext block so it stays below n.
        let mut block = pair.decrypt(&encrypted).unwrap();
        block[100] ^= 1;
        let forged = pair.public().encrypt(&block).unwrap();
        assert_eq!(decrypt_hashed(&forged, &pair), Err(Error::HashMismatch));

        assert!(matches!(
            encrypt_hashed(&[0; 145], pair.public(), &random),
            Err(Error::MessageTooLong { len: 145, max: 144 })
        ));
    }

    #[test]
    fn pem_round_trip() {
        let key = test_pair().public().clone();
        let pem = key.to_pkcs1_pem();
        assert!(pem.starts_with("-----BEGIN RSA PUBLIC KEY-----\nMIIBCgKCAQEA"));
        assert_eq!(PublicKey::from_pkcs1_pem(&pem).unwrap(), key);

        let der = key.to_pkcs1_der();
        assert_eq!(&der[..4], &[0x30, 0x82, 0x01, 0x0a]);
        assert!(PublicKey::from_pkcs1_der(&der[..20]).is_err());
        assert!(PublicKey::from_pkcs1_pem("nothing here").is_err());
    }

    #[test]
    fn generated_key_works() {
        let pair = RsaKeyPair::generate(512).unwrap();
        assert_eq!(pair.public().n().bits(), 512);
        let encrypted = pair.public().encrypt(b"hi").unwrap();
        assert_eq!(&pair.decrypt(&encrypted).unwrap()[62..], b"hi");
        assert_eq!(RsaKeyPair::generate(100), Err(Error::Generation { bits: 100 }));
    }
}
