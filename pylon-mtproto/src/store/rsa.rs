use std::sync::Arc;

use pylon_crypto::rsa::RsaKeyPair;

use super::RsaKeyStore;

/// A fixed list of key pairs.
#[derive(Clone, Debug, Default)]
pub struct RsaKeyRing {
    keys: Vec<Arc<RsaKeyPair>>,
}

impl RsaKeyRing {
    pub fn new(keys: impl IntoIterator<Item = RsaKeyPair>) -> Self {
        Self { keys: keys.into_iter().map(Arc::new).collect() }
    }

    pub fn push(&mut self, key: RsaKeyPair) {
        self.keys.push(Arc::new(key));
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl RsaKeyStore for RsaKeyRing {
    fn get(&self, fingerprint: i64) -> Option<Arc<RsaKeyPair>> {
        self.keys.iter().find(|k| k.fingerprint() == fingerprint).cloned()
    }

    fn public_key_list(&self) -> Vec<Vec<u8>> {
        self.keys.iter().map(|k| k.public().to_pkcs1_pem().into_bytes()).collect()
    }

    fn fingerprint_list(&self) -> Vec<i64> {
        self.keys.iter().map(|k| k.fingerprint()).collect()
    }
}
