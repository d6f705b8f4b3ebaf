//! RSA key discovery and development key setup.

use pylon_crypto::rsa::RsaKeyPair;
use pylon_mtproto::store::{RsaKeyRing, RsaKeyStore};

use crate::errors::{Result, ServerError};

/// Modulus width of keys generated for development.
pub const DEV_KEY_BITS: u64 = 2048;

/// The configured public keys as PKCS#1 PEM, for clients to pin.
pub fn public_keys(store: &dyn RsaKeyStore) -> Result<Vec<Vec<u8>>> {
    let keys = store.public_key_list();
    if keys.is_empty() {
        return Err(ServerError::NotConfigured);
    }
    Ok(keys)
}

/// `ring` unchanged, or a ring holding one fresh key when it is empty.
pub fn ensure_key(ring: RsaKeyRing) -> Result<RsaKeyRing> {
    if !ring.is_empty() {
        return Ok(ring);
    }
    tracing::warn!("[pylon] no RSA keys configured, generating a {DEV_KEY_BITS}-bit development key");
    let pair = RsaKeyPair::generate(DEV_KEY_BITS)?;
    tracing::info!("[pylon] development key fingerprint {:016x}", pair.fingerprint());
    Ok(RsaKeyRing::new([pair]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> RsaKeyPair {
        let text = include_str!("../../testdata/rsa_2048.txt");
        let mut parts = text.split_whitespace();
        RsaKeyPair::new(parts.next().unwrap(), parts.next().unwrap(), parts.next().unwrap()).unwrap()
    }

    #[test]
    fn empty_ring_is_not_configured() {
        assert!(matches!(public_keys(&RsaKeyRing::default()), Err(ServerError::NotConfigured)));
    }

    #[test]
    fn public_keys_are_pem() {
        let pair = pair();
        let ring = RsaKeyRing::new([pair.clone()]);
        let keys = public_keys(&ring).unwrap();
        assert_eq!(keys.len(), 1);
        let pem = String::from_utf8(keys[0].clone()).unwrap();
        assert!(pem.starts_with("-----BEGIN RSA PUBLIC KEY-----"));
        assert_eq!(pylon_crypto::rsa::PublicKey::from_pkcs1_pem(&pem).unwrap(), *pair.public());
    }

    #[test]
    fn configured_ring_is_kept() {
        let ring = ensure_key(RsaKeyRing::new([pair()])).unwrap();
        assert_eq!(ring.len(), 1);
    }
}
