//! Cryptographic primitives for an MTProto server.
//!
//! - AES-256-IGE for message payloads, AES-256-CTR for transport obfuscation
//! - SHA-1 / SHA-256 hash macros
//! - [`AuthKey`] with its id and aux hash
//! - MTProto 2.0 message key and key/iv derivation, in both directions
//! - Textbook RSA, RSA_PAD, fingerprints and PKCS#1 encoding
//! - Miller-Rabin primality and safe-prime generation
//! - Pollard-rho factorization of the handshake `pq`

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod factorize;
pub mod prime;
pub mod rsa;
mod sha;

pub use auth_key::AuthKey;
pub use factorize::factorize;

/// Errors from [`decrypt_data_v2`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match the key.
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match the decrypted payload.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}

impl std::error::Error for DecryptError {}

/// The party that produced a message.
///
/// Selects the auth key window used for key derivation: messages written by
/// the client use offset 0, messages written by the server offset 8. A
/// server-written message replayed back at the server therefore fails the
/// `msg_key` check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn x(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

/// Fill `buf` from the operating system's RNG.
pub fn fill_random(buf: &mut [u8]) {
    // Nothing sensible can continue without entropy.
    getrandom::getrandom(buf).expect("operating system RNG unavailable");
}

/// `N` random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    fill_random(&mut out);
    out
}

/// `msg_key = SHA256(auth_key[88+x..120+x] ‖ plaintext)[8..24]`, computed
/// over the padded plaintext.
pub fn msg_key(auth_key: &AuthKey, plaintext: &[u8], side: Side) -> [u8; 16] {
    let x = side.x();
    let large = sha256!(&auth_key.data[88 + x..120 + x], plaintext);
    let mut out = [0u8; 16];
    out.copy_from_slice(&large[8..24]);
    out
}

/// AES key and IV for one message from the auth key and its `msg_key`.
pub fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..76 + x], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

/// Padding bytes to append to `len` bytes of plaintext: at least 12, and
/// enough to reach a multiple of 16.
pub fn padding_len(len: usize) -> usize {
    12 + (16 - (len + 12) % 16) % 16
}

/// Encrypt `plaintext` written by `side`.
///
/// Returns `key_id ‖ msg_key ‖ ciphertext`; random padding is appended
/// before encryption.
pub fn encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, side: Side) -> Vec<u8> {
    let padding: [u8; 28] = random_array();
    do_encrypt_data_v2(plaintext, auth_key, side, &padding)
}

pub(crate) fn do_encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, side: Side, padding: &[u8; 28]) -> Vec<u8> {
    let pad = padding_len(plaintext.len());
    let mut out = Vec::with_capacity(24 + plaintext.len() + pad);
    out.extend_from_slice(&auth_key.key_id());
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(plaintext);
    out.extend_from_slice(&padding[..pad]);

    let key = msg_key(auth_key, &out[24..], side);
    let (aes_key, aes_iv) = calc_key(auth_key, &key, side);
    aes::ige_encrypt(&mut out[24..], &aes_key, &aes_iv);
    out[8..24].copy_from_slice(&key);
    out
}

/// Decrypt a message written by `side` in place.
///
/// `buffer` must start with `key_id ‖ msg_key ‖ ciphertext`. On success
/// returns the plaintext part of `buffer`, padding included.
pub fn decrypt_data_v2<'a>(buffer: &'a mut [u8], auth_key: &AuthKey, side: Side) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 + 16 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id() != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut key = [0u8; 16];
    key.copy_from_slice(&buffer[8..24]);

    let (aes_key, aes_iv) = calc_key(auth_key, &key, side);
    aes::ige_decrypt(&mut buffer[24..], &aes_key, &aes_iv);

    if msg_key(auth_key, &buffer[24..], side) != key {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

/// Temporary `(key, iv)` protecting the DH inner data, derived from
/// `server_nonce` and `new_nonce`.
pub fn generate_key_data_from_nonce(server_nonce: &[u8; 16], new_nonce: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AuthKey {
        AuthKey::from_bytes(std::array::from_fn(|i| ((i * 7 + 3) % 256) as u8))
    }

    fn counting<const N: usize>() -> [u8; N] {
        std::array::from_fn(|i| i as u8)
    }

    #[test]
    fn key_iv_recipe() {
        let msg_key: [u8; 16] = counting();
        let (k, iv) = calc_key(&key(), &msg_key, Side::Client);
        assert_eq!(hex::encode(k), "992e00c2379b82a0ef00c4229f63321265c1866cf6eceaacf402ae8c7ba16942");
        assert_eq!(hex::encode(iv), "c83e5d56adb08c2520ebc8ed8406fa9e929a8bcf4cac6f7fc774c60d5ee4c19c");

        let (k, iv) = calc_key(&key(), &msg_key, Side::Server);
        assert_eq!(hex::encode(k), "1c2b51563cfcd1c6fefce1060f4f870abe564504aba57255e232a6ab4216c2cc");
        assert_eq!(hex::encode(iv), "3f5f917edda76ce6c64047eb2ec62024cbc1997e0f1069f799a13aa67f616441");
    }

    #[test]
    fn msg_key_depends_on_side() {
        let plaintext: [u8; 48] = counting();
        assert_eq!(hex::encode(msg_key(&key(), &plaintext, Side::Client)), "713c50c7d8ce0e2e727d1840d0cbe8f3");
        assert_eq!(hex::encode(msg_key(&key(), &plaintext, Side::Server)), "3a56a510d5b01504aacb74beec4b3a20");
    }

    #[test]
    fn padding_is_at_least_twelve_and_aligns() {
        for len in 0..64 {
            let pad = padding_len(len);
            assert!((12..28).contains(&pad), "len {len} pad {pad}");
            assert_eq!((len + pad) % 16, 0);
        }
    }

    #[test]
    fn round_trip_each_direction() {
        let auth_key = key();
        let plaintext = b"salt....session.msg_id..seq.len.payload";
        for side in [Side::Client, Side::Server] {
            let mut buf = encrypt_data_v2(plaintext, &auth_key, side);
            assert_eq!(&buf[..8], &auth_key.key_id());
            assert_eq!((buf.len() - 24) % 16, 0);
            let out = decrypt_data_v2(&mut buf, &auth_key, side).unwrap();
            assert_eq!(&out[..plaintext.len()], plaintext);
        }
    }

    #[test]
    fn reflected_message_is_rejected() {
        let auth_key = key();
        let mut buf = encrypt_data_v2(b"from the server, honest", &auth_key, Side::Server);
        assert_eq!(
            decrypt_data_v2(&mut buf, &auth_key, Side::Client),
            Err(DecryptError::MessageKeyMismatch)
        );
    }

    #[test]
    fn wrong_key_and_bad_lengths() {
        let auth_key = key();
        let other = AuthKey::from_bytes([9; 256]);
        let mut buf = do_encrypt_data_v2(b"hello", &auth_key, Side::Client, &[0; 28]);
        assert_eq!(decrypt_data_v2(&mut buf, &other, Side::Client), Err(DecryptError::AuthKeyMismatch));
        assert_eq!(decrypt_data_v2(&mut buf[..30], &auth_key, Side::Client), Err(DecryptError::InvalidBuffer));
    }

    #[test]
    fn nonce_key_data_is_deterministic() {
        let server_nonce: [u8; 16] = counting();
        let new_nonce: [u8; 32] = counting();
        let (k1, iv1) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
        let (k2, iv2) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
        assert_eq!((k1, iv1), (k2, iv2));
        assert_eq!(&iv1[28..], &new_nonce[..4]);
        assert_eq!(&k1[..20], &sha1!(new_nonce, server_nonce));
    }
}
