//! Server configuration, readable from a TOML file.
//!
//! ```toml
//! listen = ["0.0.0.0:8443"]
//! salt_lifetime_secs = 3600
//! obfuscation_secret = "00112233445566778899aabbccddeeff"
//!
//! [[rsa_keys]]
//! n = "2513...1737"
//! e = "65537"
//! d = "1409...2473"
//!
//! [dh_prime]
//! kind = "generate"
//! bits = 2048
//! ```
//!
//! Every field is optional. A configuration without `rsa_keys` is valid;
//! the binary generates a key at startup in that case.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, fs, io};

use pylon_crypto::rsa::{HANDSHAKE_KEY_SIZE, RsaKeyPair};
use pylon_mtproto::MsgIdWindow;
use pylon_mtproto::store::{DhPrimeSource, FixedDhPrime, GeneratedDhPrimes, MAX_FUTURE_SALTS, RsaKeyRing};
use pylon_mtproto::transport::{AcceptOptions, DEFAULT_MAX_FRAME_LEN};
use serde::Deserialize;

/// Bits of every DH prime the handshake accepts.
const DH_PRIME_BITS: u64 = 2048;
/// Smallest frame limit that still fits a handshake message.
const MIN_FRAME_LEN: usize = 1024;

// ─── ConfigError ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(toml::de::Error),
    /// A value is out of range or malformed.
    Invalid { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)                     => write!(f, "could not read config: {e}"),
            Self::Parse(e)                  => write!(f, "could not parse config: {e}"),
            Self::Invalid { field, reason } => write!(f, "invalid `{field}`: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e)    => Some(e),
            Self::Parse(e) => Some(e),
            Self::Invalid { .. } => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self { Self::Parse(e) }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

// ─── Sections ─────────────────────────────────────────────────────────────────

/// One RSA key pair as decimal strings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RsaKeyConfig {
    pub n: String,
    pub e: String,
    pub d: String,
}

/// Where DH primes come from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DhPrimeConfig {
    /// The well-known 2048-bit prime.
    #[default]
    Fixed,
    /// A fresh safe prime for every exchange. Slow.
    Generate { bits: u64 },
}

// ─── ServerConfig ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Addresses to accept connections on.
    pub listen: Vec<SocketAddr>,
    pub rsa_keys: Vec<RsaKeyConfig>,
    pub salt_lifetime_secs: u32,
    /// How far in the past a client message id may lie.
    pub msg_id_max_past_secs: u64,
    /// How far in the future a client message id may lie.
    pub msg_id_max_future_secs: u64,
    pub max_frame_len: usize,
    /// 32 hex digits. When set, obfuscated connections must use it.
    pub obfuscation_secret: Option<String>,
    pub dh_prime: DhPrimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 8443))],
            rsa_keys: Vec::new(),
            salt_lifetime_secs: 3600,
            msg_id_max_past_secs: 300,
            msg_id_max_future_secs: 30,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            obfuscation_secret: None,
            dh_prime: DhPrimeConfig::Fixed,
        }
    }
}

impl ServerConfig {
    /// Reads and validates a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(invalid("listen", "at least one address is required"));
        }
        if self.salt_lifetime_secs == 0 || self.salt_lifetime_secs > i32::MAX as u32 {
            return Err(invalid("salt_lifetime_secs", format!("{} is out of range", self.salt_lifetime_secs)));
        }
        if self.msg_id_max_past_secs == 0 {
            return Err(invalid("msg_id_max_past_secs", "must be positive"));
        }
        if self.max_frame_len < MIN_FRAME_LEN {
            return Err(invalid("max_frame_len", format!("must be at least {MIN_FRAME_LEN}")));
        }
        if let DhPrimeConfig::Generate { bits } = self.dh_prime {
            if bits != DH_PRIME_BITS {
                return Err(invalid("dh_prime", format!("only {DH_PRIME_BITS}-bit primes are supported, got {bits}")));
            }
        }
        self.secret()?;
        self.rsa_key_ring()?;
        Ok(())
    }

    /// The decoded obfuscation secret.
    pub fn secret(&self) -> Result<Option<[u8; 16]>, ConfigError> {
        let Some(text) = &self.obfuscation_secret else {
            return Ok(None);
        };
        let bytes = hex::decode(text.trim()).map_err(|e| invalid("obfuscation_secret", e.to_string()))?;
        let secret: [u8; 16] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| invalid("obfuscation_secret", format!("expected 16 bytes, got {}", b.len())))?;
        Ok(Some(secret))
    }

    /// The configured key pairs. Empty when none are configured.
    pub fn rsa_key_ring(&self) -> Result<RsaKeyRing, ConfigError> {
        let mut ring = RsaKeyRing::default();
        for (i, key) in self.rsa_keys.iter().enumerate() {
            let pair = RsaKeyPair::new(&key.n, &key.e, &key.d)
                .map_err(|e| invalid("rsa_keys", format!("key {i}: {e}")))?;
            let size = pair.public().size();
            if size != HANDSHAKE_KEY_SIZE {
                return Err(invalid(
                    "rsa_keys",
                    format!("key {i}: modulus is {} bits, {} required", size * 8, HANDSHAKE_KEY_SIZE * 8),
                ));
            }
            ring.push(pair);
        }
        Ok(ring)
    }

    pub fn dh_prime_source(&self) -> Arc<dyn DhPrimeSource> {
        match self.dh_prime {
            DhPrimeConfig::Fixed => Arc::new(FixedDhPrime::default()),
            DhPrimeConfig::Generate { bits } => Arc::new(GeneratedDhPrimes::new(bits)),
        }
    }

    pub fn msg_id_window(&self) -> MsgIdWindow {
        MsgIdWindow {
            max_past: Duration::from_secs(self.msg_id_max_past_secs),
            max_future: Duration::from_secs(self.msg_id_max_future_secs),
        }
    }

    pub fn accept_options(&self) -> Result<AcceptOptions, ConfigError> {
        Ok(AcceptOptions { secret: self.secret()?, max_frame_len: self.max_frame_len })
    }

    /// Upper bound for `get_future_salts`.
    pub fn future_salt_limit(&self) -> i32 {
        MAX_FUTURE_SALTS
    }
}
