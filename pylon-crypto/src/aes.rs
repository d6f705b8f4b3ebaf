//! AES-256 in the two modes MTProto uses: IGE for message payloads and
//! CTR for the obfuscated transport.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use ctr::cipher::{KeyIvInit, StreamCipher};

const BLOCK: usize = 16;

fn xor_into(dst: &mut [u8; BLOCK], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Encrypt `buffer` in place with AES-256-IGE.
///
/// `iv[..16]` stands in for the previous ciphertext block and `iv[16..]`
/// for the previous plaintext block. `buffer.len()` must be a multiple of 16;
/// a trailing partial block is left untouched.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(buffer.len() % BLOCK, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher = [0u8; BLOCK];
    let mut prev_plain = [0u8; BLOCK];
    prev_cipher.copy_from_slice(&iv[..BLOCK]);
    prev_plain.copy_from_slice(&iv[BLOCK..]);

    for chunk in buffer.chunks_exact_mut(BLOCK) {
        let mut plain = [0u8; BLOCK];
        plain.copy_from_slice(chunk);

        let mut block = plain;
        xor_into(&mut block, &prev_cipher);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        xor_into(&mut block, &prev_plain);

        chunk.copy_from_slice(&block);
        prev_cipher = block;
        prev_plain = plain;
    }
}

/// Decrypt `buffer` in place with AES-256-IGE. Inverse of [`ige_encrypt`].
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(buffer.len() % BLOCK, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher = [0u8; BLOCK];
    let mut prev_plain = [0u8; BLOCK];
    prev_cipher.copy_from_slice(&iv[..BLOCK]);
    prev_plain.copy_from_slice(&iv[BLOCK..]);

    for chunk in buffer.chunks_exact_mut(BLOCK) {
        let mut encrypted = [0u8; BLOCK];
        encrypted.copy_from_slice(chunk);

        let mut block = encrypted;
        xor_into(&mut block, &prev_plain);
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
        xor_into(&mut block, &prev_cipher);

        chunk.copy_from_slice(&block);
        prev_cipher = encrypted;
        prev_plain = block;
    }
}

/// Stateful AES-256-CTR keystream (128-bit big-endian counter).
///
/// The keystream position carries over between [`AesCtr::apply`] calls,
/// so one instance must be used per direction of a connection.
pub struct AesCtr {
    inner: ctr::Ctr128BE<Aes256>,
}

impl AesCtr {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self {
            inner: ctr::Ctr128BE::<Aes256>::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ),
        }
    }

    /// XOR `data` in place with the next `data.len()` keystream bytes.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

impl std::fmt::Debug for AesCtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesCtr(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting(n: u8) -> Vec<u8> {
        (0..n).collect()
    }

    #[test]
    fn ige_known_answer() {
        let material = counting(128);
        let key: [u8; 32] = material[..32].try_into().unwrap();
        let iv: [u8; 32] = material[32..64].try_into().unwrap();
        let plain: Vec<u8> = (0..48u32).map(|i| (i * 13 % 256) as u8).collect();

        let mut buf = plain.clone();
        ige_encrypt(&mut buf, &key, &iv);
        assert_eq!(
            hex::encode(&buf),
            "1a3a3ccbbdebaa805ef8e303667d97d3392a9ca0df49abe4b8da5341c68d5af652a28684a5d8813d3c68a3ddcd675c1c"
        );

        ige_decrypt(&mut buf, &key, &iv);
        assert_eq!(buf, plain);
    }

    #[test]
    fn ctr_known_answer_and_continuity() {
        let material = counting(128);
        let key: [u8; 32] = material[..32].try_into().unwrap();
        let iv: [u8; 16] = material[100..116].try_into().unwrap();

        let mut whole = [0u8; 20];
        AesCtr::new(&key, &iv).apply(&mut whole);
        assert_eq!(hex::encode(whole), "93d81120b620bb4d7e8dbfabe6bf90dcb5e98b05");

        // Split application continues the same keystream.
        let mut split = [0u8; 20];
        let mut ctr = AesCtr::new(&key, &iv);
        ctr.apply(&mut split[..7]);
        ctr.apply(&mut split[7..]);
        assert_eq!(split, whole);
    }
}
