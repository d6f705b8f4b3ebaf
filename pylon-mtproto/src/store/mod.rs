//! Contracts for the state a server shares between connections, with
//! in-memory implementations.
//!
//! Every async store takes `&self` and may be backed by a remote service.
//! The in-memory stores lock per auth key (salts, acks) or per map
//! (auth keys, sessions), never across an `.await` on another store.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use num_bigint::BigUint;
use pylon_crypto::AuthKey;
use pylon_crypto::rsa::RsaKeyPair;

mod dh;
mod memory;
mod observable;
mod rsa;

pub use dh::{FixedDhPrime, GeneratedDhPrimes};
pub use memory::{MemoryAcks, MemoryAuthKeys, MemorySalts, MemorySessions};
pub use observable::{ObservableSessions, SessionEvent, SessionObserver, SubscriptionId};
pub use rsa::RsaKeyRing;

/// Most salts a single `get_future_salts` may return.
pub const MAX_FUTURE_SALTS: i32 = 64;

/// Default lifetime of an issued server salt, in seconds.
pub const DEFAULT_SALT_LIFETIME: i32 = 3600;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The requested entry does not exist.
    NotFound,
    /// The backing service failed.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Backend(e) => write!(f, "store backend: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Seconds since the Unix epoch, as carried by TL `int` timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> i32;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i32 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i32).unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI32);

impl ManualClock {
    pub fn new(now: i32) -> Self {
        Self(AtomicI32::new(now))
    }

    pub fn set(&self, now: i32) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i32) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait AuthKeyStore: Send + Sync {
    async fn set(&self, key: AuthKey) -> Result<()>;
    async fn has(&self, key_id: u64) -> Result<bool>;
    /// [`StoreError::NotFound`] for an unknown id.
    async fn get(&self, key_id: u64) -> Result<AuthKey>;
    /// [`StoreError::NotFound`] for an unknown id.
    async fn delete(&self, key_id: u64) -> Result<()>;
}

/// One server salt and the half-open window `[valid_since, valid_until)`
/// in which it is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FutureSalt {
    pub valid_since: i32,
    pub valid_until: i32,
    pub salt: i64,
}

impl FutureSalt {
    pub fn is_valid_at(&self, now: i32) -> bool {
        self.valid_since <= now && now < self.valid_until
    }
}

#[async_trait]
pub trait ServerSaltStore: Send + Sync {
    /// Whether `salt` is valid for the key right now.
    async fn has_salt(&self, key_id: u64, salt: i64) -> Result<bool>;
    /// Makes `salt` valid from now for one salt lifetime.
    async fn set_salt(&self, key_id: u64, salt: i64) -> Result<()>;
    /// The current salt followed by upcoming ones, generating as needed.
    /// `count` is clamped to `1..=64`.
    async fn get_future_salts(&self, key_id: u64, count: i32) -> Result<Vec<FutureSalt>>;
    /// Drops expired salts of one key, or of every key.
    async fn clear(&self, key_id: Option<u64>) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns whether the session is new.
    async fn create(&self, key_id: u64, session_id: i64) -> Result<bool>;
    async fn has(&self, key_id: u64, session_id: i64) -> Result<bool>;
    /// Returns whether the session existed.
    async fn destroy(&self, key_id: u64, session_id: i64) -> Result<bool>;
}

/// Server messages waiting for the client's `msgs_ack`, keyed by
/// `(auth key, session)`. A payload is the encoded `message` entry, ready to
/// be placed in a container again.
#[async_trait]
pub trait AckStore: Send + Sync {
    async fn set(&self, key_id: u64, session_id: i64, msg_id: i64, payload: Vec<u8>) -> Result<()>;
    /// Pending entries in `msg_id` order.
    async fn get_list(&self, key_id: u64, session_id: i64) -> Result<Vec<(i64, Vec<u8>)>>;
    /// Removing an id that is not pending is not an error.
    async fn delete(&self, key_id: u64, session_id: i64, msg_id: i64) -> Result<()>;
    async fn create_session_store(&self, key_id: u64, session_id: i64) -> Result<()>;
    async fn drop_session_store(&self, key_id: u64, session_id: i64) -> Result<()>;
}

/// An endless supply of safe primes for the DH exchange.
#[async_trait]
pub trait DhPrimeSource: Send + Sync {
    async fn next_prime(&self) -> Result<BigUint>;
}

/// The server's RSA key pairs, looked up by fingerprint.
pub trait RsaKeyStore: Send + Sync {
    fn get(&self, fingerprint: i64) -> Option<Arc<RsaKeyPair>>;

    fn contains(&self, fingerprint: i64) -> bool {
        self.get(fingerprint).is_some()
    }

    /// Public keys as PKCS#1 PEM.
    fn public_key_list(&self) -> Vec<Vec<u8>>;

    fn fingerprint_list(&self) -> Vec<i64>;
}

/// Every store a server needs, shared between connections.
#[derive(Clone)]
pub struct Stores {
    pub auth_keys: Arc<dyn AuthKeyStore>,
    pub salts: Arc<dyn ServerSaltStore>,
    pub sessions: Arc<ObservableSessions>,
    pub acks: Arc<dyn AckStore>,
    pub rsa_keys: Arc<dyn RsaKeyStore>,
    pub dh_primes: Arc<dyn DhPrimeSource>,
}

impl Stores {
    /// In-memory stores around `rsa_keys`, using the fixed 2048-bit prime.
    pub fn in_memory(rsa_keys: RsaKeyRing) -> Self {
        Self::in_memory_with(rsa_keys, Arc::new(FixedDhPrime::default()), Arc::new(SystemClock), DEFAULT_SALT_LIFETIME)
    }

    pub fn in_memory_with(
        rsa_keys: RsaKeyRing,
        dh_primes: Arc<dyn DhPrimeSource>,
        clock: Arc<dyn Clock>,
        salt_lifetime: i32,
    ) -> Self {
        Self {
            auth_keys: Arc::new(MemoryAuthKeys::new()),
            salts: Arc::new(MemorySalts::new(clock, salt_lifetime)),
            sessions: Arc::new(ObservableSessions::new(Arc::new(MemorySessions::new()))),
            acks: Arc::new(MemoryAcks::new()),
            rsa_keys: Arc::new(rsa_keys),
            dh_primes,
        }
    }
}

impl fmt::Debug for Stores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stores")
            .field("rsa_fingerprints", &self.rsa_keys.fingerprint_list())
            .finish_non_exhaustive()
    }
}
