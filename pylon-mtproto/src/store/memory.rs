use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use pylon_crypto::AuthKey;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use super::{
    AckStore, AuthKeyStore, Clock, FutureSalt, MAX_FUTURE_SALTS, Result, ServerSaltStore, SessionStore, StoreError,
};

/// One async lock per key, created on first use.
struct KeyedLocks<K, V> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<V>>>>,
}

impl<K: std::hash::Hash + Eq + Copy, V: Default> KeyedLocks<K, V> {
    fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    fn slot(&self, key: K) -> Arc<AsyncMutex<V>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key).or_default().clone()
    }

    fn existing(&self, key: K) -> Option<Arc<AsyncMutex<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).get(&key).cloned()
    }

    fn keys(&self) -> Vec<K> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).keys().copied().collect()
    }

    fn remove(&self, key: K) {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
    }
}

// ─── Auth keys ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAuthKeys {
    keys: RwLock<HashMap<u64, AuthKey>>,
}

impl MemoryAuthKeys {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthKeyStore for MemoryAuthKeys {
    async fn set(&self, key: AuthKey) -> Result<()> {
        self.keys.write().await.insert(key.id(), key);
        Ok(())
    }

    async fn has(&self, key_id: u64) -> Result<bool> {
        Ok(self.keys.read().await.contains_key(&key_id))
    }

    async fn get(&self, key_id: u64) -> Result<AuthKey> {
        self.keys.read().await.get(&key_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn delete(&self, key_id: u64) -> Result<()> {
        self.keys.write().await.remove(&key_id).map(drop).ok_or(StoreError::NotFound)
    }
}

// ─── Salts ───────────────────────────────────────────────────────────────────

/// Salts per auth key, sorted by `valid_since`.
pub struct MemorySalts {
    clock: Arc<dyn Clock>,
    lifetime: i32,
    salts: KeyedLocks<u64, Vec<FutureSalt>>,
}

impl MemorySalts {
    pub fn new(clock: Arc<dyn Clock>, lifetime: i32) -> Self {
        Self { clock, lifetime: lifetime.max(1), salts: KeyedLocks::new() }
    }

    fn random_salt() -> i64 {
        i64::from_le_bytes(pylon_crypto::random_array())
    }
}

#[async_trait]
impl ServerSaltStore for MemorySalts {
    async fn has_salt(&self, key_id: u64, salt: i64) -> Result<bool> {
        let Some(slot) = self.salts.existing(key_id) else {
            return Ok(false);
        };
        let now = self.clock.now();
        Ok(slot.lock().await.iter().any(|s| s.salt == salt && s.is_valid_at(now)))
    }

    async fn set_salt(&self, key_id: u64, salt: i64) -> Result<()> {
        let now = self.clock.now();
        let slot = self.salts.slot(key_id);
        let mut salts = slot.lock().await;
        salts.push(FutureSalt { valid_since: now, valid_until: now.saturating_add(self.lifetime), salt });
        salts.sort_by_key(|s| s.valid_since);
        Ok(())
    }

    async fn get_future_salts(&self, key_id: u64, count: i32) -> Result<Vec<FutureSalt>> {
        let count = count.clamp(1, MAX_FUTURE_SALTS) as usize;
        let now = self.clock.now();
        let slot = self.salts.slot(key_id);
        let mut salts = slot.lock().await;

        salts.retain(|s| s.valid_until > now);
        while salts.len() < count {
            let valid_since = salts.last().map_or(now, |s| s.valid_until);
            salts.push(FutureSalt {
                valid_since,
                valid_until: valid_since.saturating_add(self.lifetime),
                salt: Self::random_salt(),
            });
        }
        Ok(salts[..count].to_vec())
    }

    async fn clear(&self, key_id: Option<u64>) -> Result<()> {
        let now = self.clock.now();
        let keys = match key_id {
            Some(id) => vec![id],
            None => self.salts.keys(),
        };
        for id in keys {
            let Some(slot) = self.salts.existing(id) else { continue };
            let mut salts = slot.lock().await;
            salts.retain(|s| s.valid_until > now);
            if salts.is_empty() {
                drop(salts);
                self.salts.remove(id);
            }
        }
        Ok(())
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySessions {
    sessions: RwLock<HashSet<(u64, i64)>>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessions {
    async fn create(&self, key_id: u64, session_id: i64) -> Result<bool> {
        Ok(self.sessions.write().await.insert((key_id, session_id)))
    }

    async fn has(&self, key_id: u64, session_id: i64) -> Result<bool> {
        Ok(self.sessions.read().await.contains(&(key_id, session_id)))
    }

    async fn destroy(&self, key_id: u64, session_id: i64) -> Result<bool> {
        Ok(self.sessions.write().await.remove(&(key_id, session_id)))
    }
}

// ─── Acks ────────────────────────────────────────────────────────────────────

pub struct MemoryAcks {
    pending: KeyedLocks<(u64, i64), BTreeMap<i64, Vec<u8>>>,
}

impl MemoryAcks {
    pub fn new() -> Self {
        Self { pending: KeyedLocks::new() }
    }
}

impl Default for MemoryAcks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AckStore for MemoryAcks {
    async fn set(&self, key_id: u64, session_id: i64, msg_id: i64, payload: Vec<u8>) -> Result<()> {
        let slot = self.pending.slot((key_id, session_id));
        slot.lock().await.insert(msg_id, payload);
        Ok(())
    }

    async fn get_list(&self, key_id: u64, session_id: i64) -> Result<Vec<(i64, Vec<u8>)>> {
        let Some(slot) = self.pending.existing((key_id, session_id)) else {
            return Ok(Vec::new());
        };
        let pending = slot.lock().await;
        Ok(pending.iter().map(|(id, payload)| (*id, payload.clone())).collect())
    }

    async fn delete(&self, key_id: u64, session_id: i64, msg_id: i64) -> Result<()> {
        if let Some(slot) = self.pending.existing((key_id, session_id)) {
            slot.lock().await.remove(&msg_id);
        }
        Ok(())
    }

    async fn create_session_store(&self, key_id: u64, session_id: i64) -> Result<()> {
        self.pending.slot((key_id, session_id));
        Ok(())
    }

    async fn drop_session_store(&self, key_id: u64, session_id: i64) -> Result<()> {
        self.pending.remove((key_id, session_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ManualClock;

    fn salts(clock: &Arc<ManualClock>) -> MemorySalts {
        MemorySalts::new(clock.clone(), 100)
    }

    #[tokio::test]
    async fn salt_window_is_half_open() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = salts(&clock);
        store.set_salt(1, 42).await.unwrap();

        assert!(store.has_salt(1, 42).await.unwrap());
        assert!(!store.has_salt(1, 43).await.unwrap());
        assert!(!store.has_salt(2, 42).await.unwrap());

        clock.set(999);
        assert!(!store.has_salt(1, 42).await.unwrap());
        clock.set(1099);
        assert!(store.has_salt(1, 42).await.unwrap());
        clock.set(1100);
        assert!(!store.has_salt(1, 42).await.unwrap());
    }

    #[tokio::test]
    async fn future_salt_count_is_clamped() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = salts(&clock);
        assert_eq!(store.get_future_salts(1, 128).await.unwrap().len(), 64);
        assert_eq!(store.get_future_salts(1, 0).await.unwrap().len(), 1);
        assert_eq!(store.get_future_salts(1, -5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn future_salts_are_contiguous_and_stable() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = salts(&clock);
        store.set_salt(7, 5).await.unwrap();

        let first = store.get_future_salts(7, 3).await.unwrap();
        assert_eq!(first[0].salt, 5);
        assert_eq!(first[1].valid_since, first[0].valid_until);
        assert_eq!(first[2].valid_since, first[1].valid_until);
        assert_eq!(store.get_future_salts(7, 3).await.unwrap(), first);

        clock.advance(100);
        let later = store.get_future_salts(7, 1).await.unwrap();
        assert_eq!(later[0], first[1]);
        assert!(store.has_salt(7, first[1].salt).await.unwrap());
    }

    #[tokio::test]
    async fn clear_drops_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let store = salts(&clock);
        store.set_salt(1, 1).await.unwrap();
        store.set_salt(2, 2).await.unwrap();
        clock.set(500);
        store.clear(None).await.unwrap();
        assert!(store.salts.keys().is_empty());
    }

    #[tokio::test]
    async fn auth_keys() {
        let store = MemoryAuthKeys::new();
        let key = AuthKey::from_bytes([9; 256]);
        assert_eq!(store.get(key.id()).await, Err(StoreError::NotFound));
        store.set(key.clone()).await.unwrap();
        assert!(store.has(key.id()).await.unwrap());
        assert_eq!(store.get(key.id()).await.unwrap(), key);
        store.delete(key.id()).await.unwrap();
        assert_eq!(store.delete(key.id()).await, Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn acks_are_scoped_and_ordered() {
        let store = MemoryAcks::new();
        store.set(1, 10, 9, vec![9]).await.unwrap();
        store.set(1, 10, 5, vec![5]).await.unwrap();
        store.set(1, 11, 7, vec![7]).await.unwrap();

        assert_eq!(store.get_list(1, 10).await.unwrap(), vec![(5, vec![5]), (9, vec![9])]);
        store.delete(1, 10, 5).await.unwrap();
        store.delete(1, 10, 5).await.unwrap();
        assert_eq!(store.get_list(1, 10).await.unwrap(), vec![(9, vec![9])]);

        store.drop_session_store(1, 11).await.unwrap();
        assert!(store.get_list(1, 11).await.unwrap().is_empty());
    }
}
