use std::hash::{Hash, Hasher};

use num_bigint::BigUint;

/// A 2048-bit MTProto authorization key with its derived identifiers.
///
/// Equality and hashing go through the 64-bit key id, which is how stores
/// and the wire refer to a key.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    aux_hash: [u8; 8],
    key_id: [u8; 8],
}

impl AuthKey {
    /// Wrap 256 raw key bytes.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let sha = crate::sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id }
    }

    /// Build a key from the DH shared secret `g^ab mod p`, left-padding it
    /// to 256 big-endian bytes. `None` if the value is wider than 2048 bits.
    pub fn from_shared_secret(g_ab: &BigUint) -> Option<Self> {
        let raw = g_ab.to_bytes_be();
        if raw.len() > 256 {
            return None;
        }
        let mut data = [0u8; 256];
        data[256 - raw.len()..].copy_from_slice(&raw);
        Some(Self::from_bytes(data))
    }

    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8; 256] {
        &self.data
    }

    /// The eight key-id bytes as they appear on the wire.
    pub fn key_id(&self) -> [u8; 8] {
        self.key_id
    }

    /// The key id as the little-endian integer carried in encrypted envelopes.
    pub fn id(&self) -> u64 {
        u64::from_le_bytes(self.key_id)
    }

    pub fn aux_hash(&self) -> [u8; 8] {
        self.aux_hash
    }

    /// `SHA1(new_nonce ‖ number ‖ aux_hash)[4..20]`, where `number` is 1, 2
    /// or 3 for `dh_gen_ok`, `dh_gen_retry` and `dh_gen_fail`.
    pub fn calc_new_nonce_hash(&self, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let sha = crate::sha1!(new_nonce, [number], self.aux_hash);
        let mut out = [0u8; 16];
        out.copy_from_slice(&sha[4..]);
        out
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKey").field("id", &self.id()).finish()
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}

impl Eq for AuthKey {}

impl Hash for AuthKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuthKey {
        AuthKey::from_bytes(std::array::from_fn(|i| ((i * 7 + 3) % 256) as u8))
    }

    #[test]
    fn derived_identifiers() {
        let key = sample();
        assert_eq!(key.id(), 3587517436832175774);
        assert_eq!(hex::encode(key.aux_hash()), "6aa0e62cd373dc2e");
        assert_eq!(key.key_id(), key.id().to_le_bytes());
    }

    #[test]
    fn new_nonce_hashes() {
        let key = sample();
        let new_nonce: [u8; 32] = std::array::from_fn(|i| i as u8);
        assert_eq!(hex::encode(key.calc_new_nonce_hash(&new_nonce, 1)), "12811471ddb38ecd4f79c28eaa588522");
        assert_eq!(hex::encode(key.calc_new_nonce_hash(&new_nonce, 2)), "0e29d4711fb4975c828055065d8a5ac7");
        assert_eq!(hex::encode(key.calc_new_nonce_hash(&new_nonce, 3)), "8bd4764c9e6fbbbdda409eee97f0fd34");
    }

    #[test]
    fn shared_secret_is_left_padded() {
        let key = AuthKey::from_shared_secret(&BigUint::from(0x0102u32)).unwrap();
        let bytes = key.to_bytes();
        assert!(bytes[..254].iter().all(|&b| b == 0));
        assert_eq!(&bytes[254..], &[1, 2]);

        let too_wide = BigUint::from(1u8) << 2048usize;
        assert!(AuthKey::from_shared_secret(&too_wide).is_none());
    }
}
