//! Server side of the MTProto auth key exchange.
//!
//! One [`Handshake`] lives per connection and walks
//!
//! ```text
//! Init -(req_pq)-> NoncesIssued -(req_DH_params)-> DhParamsSent -(set_client_DH_params)-> Established
//! ```
//!
//! Protocol violations are returned as [`Error`] and should end the
//! connection. `server_DH_params_fail`, `dh_gen_retry` and `dh_gen_fail`
//! are ordinary answers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use pylon_crypto::rsa::{self, RsaKeyPair};
use pylon_crypto::{AuthKey, aes, generate_key_data_from_nonce, prime, random_array};
use pylon_tl::{Call, EncodeError, Object, SchemaError, SchemaSet, Value, deserialize};

use crate::service;
use crate::store::{StoreError, Stores};

/// Width of the secret exponent `a`.
const SECRET_BITS: u64 = 2048;
/// Width of each factor of `pq`.
const PQ_FACTOR_BITS: u64 = 32;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A handshake call arrived in a state that cannot accept it.
    UnexpectedCall { call: String, stage: Stage },
    MissingField { owner: String, field: &'static str },
    InvalidNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidServerNonce { got: [u8; 16], expected: [u8; 16] },
    UnknownFingerprint { fingerprint: i64 },
    NoRsaKeys,
    Rsa(rsa::Error),
    /// The SHA-1 or RSA_PAD integrity check over the inner data failed.
    InnerDataHashMismatch,
    /// The inner data decoded to an unexpected constructor or shape.
    InvalidInnerData { detail: String },
    EncryptedDataNotPadded { len: usize },
    /// `g_b` (or a generated `g_a`) failed the DH range checks.
    DhValueOutOfRange,
    /// No generator in `2..=7` suits the configured prime.
    NoGenerator,
    /// The shared secret does not fit in 2048 bits.
    PrimeTooLarge { bits: u64 },
    Schema(SchemaError),
    Encode(EncodeError),
    Decode(deserialize::Error),
    Store(StoreError),
    /// A blocking crypto task panicked or was cancelled.
    Worker(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedCall { call, stage } => write!(f, "unexpected `{call}` in stage {stage:?}"),
            Self::MissingField { owner, field } => write!(f, "`{owner}` is missing `{field}`"),
            Self::InvalidNonce { .. } => write!(f, "nonce mismatch"),
            Self::InvalidServerNonce { .. } => write!(f, "server_nonce mismatch"),
            Self::UnknownFingerprint { fingerprint } => write!(f, "unknown RSA key fingerprint {fingerprint}"),
            Self::NoRsaKeys => write!(f, "no RSA keys configured"),
            Self::Rsa(e) => write!(f, "rsa: {e}"),
            Self::InnerDataHashMismatch => write!(f, "inner data hash mismatch"),
            Self::InvalidInnerData { detail } => write!(f, "invalid inner data: {detail}"),
            Self::EncryptedDataNotPadded { len } => {
                write!(f, "encrypted data length {len} is not a positive multiple of 16")
            }
            Self::DhValueOutOfRange => write!(f, "DH value out of range"),
            Self::NoGenerator => write!(f, "no usable generator for the DH prime"),
            Self::PrimeTooLarge { bits } => write!(f, "DH prime of {bits} bits is too large"),
            Self::Schema(e) => write!(f, "schema: {e}"),
            Self::Encode(e) => write!(f, "encode: {e}"),
            Self::Decode(e) => write!(f, "decode: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
            Self::Worker(e) => write!(f, "worker: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Self::Rsa(e)
    }
}

impl From<SchemaError> for Error {
    fn from(e: SchemaError) -> Self {
        Self::Schema(e)
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<deserialize::Error> for Error {
    fn from(e: deserialize::Error) -> Self {
        Self::Decode(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Init,
    NoncesIssued,
    DhParamsSent,
    Established,
}

enum State {
    Init,
    NoncesIssued { nonce: [u8; 16], server_nonce: [u8; 16], p: u64, q: u64 },
    DhParamsSent(Box<DhState>),
    Established { auth_key_id: u64 },
}

struct DhState {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    a: BigUint,
    dh_prime: BigUint,
    /// Aux hash of the key a `dh_gen_retry` was answered for.
    retry_aux: Option<i64>,
}

/// Per-connection handshake state.
pub struct Handshake {
    state: State,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake").field("stage", &self.stage()).finish()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self { state: State::Init }
    }

    pub fn stage(&self) -> Stage {
        match self.state {
            State::Init => Stage::Init,
            State::NoncesIssued { .. } => Stage::NoncesIssued,
            State::DhParamsSent(_) => Stage::DhParamsSent,
            State::Established { .. } => Stage::Established,
        }
    }

    /// Id of the key this handshake registered, once established.
    pub fn auth_key_id(&self) -> Option<u64> {
        match self.state {
            State::Established { auth_key_id } => Some(auth_key_id),
            _ => None,
        }
    }

    /// Answers one of the unencrypted handshake calls.
    pub async fn handle(&mut self, call: &Call, stores: &Stores) -> Result<Object, Error> {
        match call.name.as_str() {
            "req_pq" | "req_pq_multi" => self.req_pq(call, stores),
            "req_DH_params" => self.req_dh_params(call, stores).await,
            "set_client_DH_params" => self.set_client_dh_params(call, stores).await,
            _ => Err(self.unexpected(call)),
        }
    }

    fn unexpected(&self, call: &Call) -> Error {
        Error::UnexpectedCall { call: call.name.clone(), stage: self.stage() }
    }

    /// A new `req_pq` restarts the exchange from any stage.
    fn req_pq(&mut self, call: &Call, stores: &Stores) -> Result<Object, Error> {
        let nonce = int128(call, "nonce")?;
        let fingerprints = stores.rsa_keys.fingerprint_list();
        if fingerprints.is_empty() {
            return Err(Error::NoRsaKeys);
        }
        let pick = u64::from_le_bytes(random_array()) as usize % fingerprints.len();

        let (p, q) = pq_factors()?;
        let server_nonce: [u8; 16] = random_array();
        log::debug!("[handshake] {} issued pq={}", call.name, p * q);

        self.state = State::NoncesIssued { nonce, server_nonce, p, q };
        Ok(Object::new("resPQ")
            .with("nonce", nonce)
            .with("server_nonce", server_nonce)
            .with("pq", min_be_bytes(p * q))
            .with("server_public_key_fingerprints", Value::vector([fingerprints[pick]])))
    }

    async fn req_dh_params(&mut self, call: &Call, stores: &Stores) -> Result<Object, Error> {
        let State::NoncesIssued { nonce, server_nonce, p, q } = self.state else {
            return Err(self.unexpected(call));
        };
        check_nonce(&int128(call, "nonce")?, &nonce)?;
        check_server_nonce(&int128(call, "server_nonce")?, &server_nonce)?;

        let fingerprint = call.long("public_key_fingerprint").ok_or_else(|| missing(call, "public_key_fingerprint"))?;
        let key = stores.rsa_keys.get(fingerprint).ok_or(Error::UnknownFingerprint { fingerprint })?;
        let encrypted = bytes(call, "encrypted_data")?.to_vec();

        let inner = blocking(move || open_inner_data(&key, &encrypted)).await?;
        if !inner.name.starts_with("p_q_inner_data") {
            return Err(Error::InvalidInnerData { detail: format!("unexpected `{}`", inner.name) });
        }
        check_nonce(&int128_of(&inner, "nonce")?, &nonce)?;
        check_server_nonce(&int128_of(&inner, "server_nonce")?, &server_nonce)?;
        let new_nonce = inner.int256("new_nonce").ok_or_else(|| missing_in(&inner, "new_nonce"))?;

        let req_p = be_u64(bytes(call, "p")?);
        let req_q = be_u64(bytes(call, "q")?);
        let inner_p = be_u64(inner.bytes("p").unwrap_or_default());
        let inner_q = be_u64(inner.bytes("q").unwrap_or_default());
        let inner_pq = be_u64(inner.bytes("pq").unwrap_or_default());
        let factors_match = req_p == Some(p)
            && req_q == Some(q)
            && inner_p == Some(p)
            && inner_q == Some(q)
            && inner_pq == Some(p * q);
        if !factors_match {
            log::warn!("[handshake] client sent wrong pq factors");
            self.state = State::Init;
            let digest = pylon_crypto::sha1!(&new_nonce);
            let mut new_nonce_hash = [0u8; 16];
            new_nonce_hash.copy_from_slice(&digest[4..]);
            return Ok(Object::new("server_DH_params_fail")
                .with("nonce", nonce)
                .with("server_nonce", server_nonce)
                .with("new_nonce_hash", new_nonce_hash));
        }

        let dh_prime = stores.dh_primes.next_prime().await?;
        let prime = dh_prime.clone();
        let (encrypted_answer, a) =
            blocking(move || encrypt_dh_answer(nonce, server_nonce, &new_nonce, &prime)).await?;

        self.state = State::DhParamsSent(Box::new(DhState {
            nonce,
            server_nonce,
            new_nonce,
            a,
            dh_prime,
            retry_aux: None,
        }));
        Ok(Object::new("server_DH_params_ok")
            .with("nonce", nonce)
            .with("server_nonce", server_nonce)
            .with("encrypted_answer", encrypted_answer))
    }

    async fn set_client_dh_params(&mut self, call: &Call, stores: &Stores) -> Result<Object, Error> {
        let stage = self.stage();
        let State::DhParamsSent(dh) = &mut self.state else {
            return Err(Error::UnexpectedCall { call: call.name.clone(), stage });
        };
        check_nonce(&int128(call, "nonce")?, &dh.nonce)?;
        check_server_nonce(&int128(call, "server_nonce")?, &dh.server_nonce)?;

        let encrypted = bytes(call, "encrypted_data")?.to_vec();
        if encrypted.is_empty() || encrypted.len() % 16 != 0 {
            return Err(Error::EncryptedDataNotPadded { len: encrypted.len() });
        }

        let (server_nonce, new_nonce) = (dh.server_nonce, dh.new_nonce);
        let (a, prime) = (dh.a.clone(), dh.dh_prime.clone());
        let (inner, auth_key) =
            blocking(move || open_client_dh(&server_nonce, &new_nonce, &a, &prime, encrypted)).await?;

        check_nonce(&int128_of(&inner, "nonce")?, &dh.nonce)?;
        check_server_nonce(&int128_of(&inner, "server_nonce")?, &dh.server_nonce)?;
        let retry_id = inner.long("retry_id").ok_or_else(|| missing_in(&inner, "retry_id"))?;

        let answer = |name: &str, field: &str, number: u8| {
            Object::new(name)
                .with("nonce", dh.nonce)
                .with("server_nonce", dh.server_nonce)
                .with(field, auth_key.calc_new_nonce_hash(&dh.new_nonce, number))
        };

        if let Some(expected) = dh.retry_aux {
            if retry_id != expected {
                log::warn!("[handshake] retry_id {retry_id} does not match the retried key");
                let fail = answer("dh_gen_fail", "new_nonce_hash3", 3);
                self.state = State::Init;
                return Ok(fail);
            }
        }

        if stores.auth_keys.has(auth_key.id()).await? {
            log::info!("[handshake] auth key {:016x} already registered, asking for a retry", auth_key.id());
            let retry = answer("dh_gen_retry", "new_nonce_hash2", 2);
            dh.retry_aux = Some(i64::from_le_bytes(auth_key.aux_hash()));
            return Ok(retry);
        }

        let ok = answer("dh_gen_ok", "new_nonce_hash1", 1);
        let salt = first_salt(&dh.server_nonce, &dh.new_nonce);
        let auth_key_id = auth_key.id();
        stores.auth_keys.set(auth_key).await?;
        stores.salts.set_salt(auth_key_id, salt).await?;
        log::info!("[handshake] auth key {auth_key_id:016x} established");

        self.state = State::Established { auth_key_id };
        Ok(ok)
    }
}

/// `new_nonce[..8] XOR server_nonce[..8]`, read little-endian.
pub fn first_salt(server_nonce: &[u8; 16], new_nonce: &[u8; 32]) -> i64 {
    let mut buf = [0u8; 8];
    for ((dst, a), b) in buf.iter_mut().zip(&new_nonce[..8]).zip(&server_nonce[..8]) {
        *dst = a ^ b;
    }
    i64::from_le_bytes(buf)
}

// ─── CPU-bound steps ─────────────────────────────────────────────────────────

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T, Error> + Send + 'static) -> Result<T, Error> {
    tokio::task::spawn_blocking(f).await.map_err(|e| Error::Worker(e.to_string()))?
}

fn service_set() -> Result<SchemaSet, Error> {
    Ok(service::schema_set(None)?)
}

fn pq_factors() -> Result<(u64, u64), Error> {
    let factor = || {
        prime::generate_prime(PQ_FACTOR_BITS)
            .and_then(|p| p.to_u64())
            .ok_or_else(|| Error::Worker("prime generation failed".into()))
    };
    let mut p = factor()?;
    let mut q = factor()?;
    while p == q {
        q = factor()?;
    }
    if p > q {
        std::mem::swap(&mut p, &mut q);
    }
    Ok((p, q))
}

/// Decrypts `encrypted_data` of `req_DH_params`, accepting both the
/// `sha1 ‖ data ‖ padding` form and RSA_PAD.
fn open_inner_data(key: &RsaKeyPair, encrypted: &[u8]) -> Result<Object, Error> {
    let set = service_set()?;
    let raw = key.decrypt(encrypted)?;

    if let Some((&0, payload)) = raw.split_first() {
        if let Some((hash, body)) = payload.split_at_checked(20) {
            if let Ok((value, used)) = set.load(body) {
                if pylon_crypto::sha1!(&body[..used]) == *hash {
                    return into_object(value);
                }
            }
        }
    }

    let data = rsa::unwrap_hashed(&raw).map_err(|_| Error::InnerDataHashMismatch)?;
    let (value, _) = set.load(&data)?;
    into_object(value)
}

/// Builds and encrypts `server_DH_inner_data`, returning it with the
/// secret exponent.
fn encrypt_dh_answer(
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: &[u8; 32],
    dh_prime: &BigUint,
) -> Result<(Vec<u8>, BigUint), Error> {
    let generators = prime::good_generators(dh_prime);
    if generators.is_empty() {
        return Err(Error::NoGenerator);
    }
    let g = generators[random_array::<1>()[0] as usize % generators.len()];
    let g_big = BigUint::from(g);

    let mut secret = None;
    for _ in 0..16 {
        let a = prime::random_bits(SECRET_BITS);
        let g_a = g_big.modpow(&a, dh_prime);
        if prime::check_dh_value(&g_a, dh_prime) {
            secret = Some((a, g_a));
            break;
        }
    }
    let (a, g_a) = secret.ok_or(Error::DhValueOutOfRange)?;

    let inner = Object::new("server_DH_inner_data")
        .with("nonce", nonce)
        .with("server_nonce", server_nonce)
        .with("g", g as i32)
        .with("dh_prime", dh_prime.to_bytes_be())
        .with("g_a", g_a.to_bytes_be())
        .with("server_time", unix_now());
    let answer = service_set()?.dump(&inner.into())?;

    let mut hashed = Vec::with_capacity(20 + answer.len() + 16);
    hashed.extend_from_slice(&pylon_crypto::sha1!(&answer));
    hashed.extend_from_slice(&answer);
    let pad = (16 - hashed.len() % 16) % 16;
    hashed.extend_from_slice(&random_array::<16>()[..pad]);

    let (key, iv) = generate_key_data_from_nonce(&server_nonce, new_nonce);
    aes::ige_encrypt(&mut hashed, &key, &iv);
    Ok((hashed, a))
}

/// Decrypts `client_DH_inner_data` and derives the auth key from its `g_b`.
fn open_client_dh(
    server_nonce: &[u8; 16],
    new_nonce: &[u8; 32],
    a: &BigUint,
    dh_prime: &BigUint,
    mut encrypted: Vec<u8>,
) -> Result<(Object, AuthKey), Error> {
    let (key, iv) = generate_key_data_from_nonce(server_nonce, new_nonce);
    aes::ige_decrypt(&mut encrypted, &key, &iv);
    if encrypted.len() < 20 {
        return Err(Error::EncryptedDataNotPadded { len: encrypted.len() });
    }

    let (value, used) = service_set()?.load(&encrypted[20..])?;
    if pylon_crypto::sha1!(&encrypted[20..20 + used]) != encrypted[..20] {
        return Err(Error::InnerDataHashMismatch);
    }
    if encrypted.len() - 20 - used >= 16 {
        return Err(Error::InvalidInnerData { detail: "excess padding".into() });
    }
    let inner = into_object(value)?;
    if inner.name != "client_DH_inner_data" {
        return Err(Error::InvalidInnerData { detail: format!("unexpected `{}`", inner.name) });
    }

    let g_b = BigUint::from_bytes_be(inner.bytes("g_b").ok_or_else(|| missing_in(&inner, "g_b"))?);
    if !prime::check_dh_value(&g_b, dh_prime) {
        return Err(Error::DhValueOutOfRange);
    }
    let g_ab = g_b.modpow(a, dh_prime);
    let auth_key = AuthKey::from_shared_secret(&g_ab).ok_or(Error::PrimeTooLarge { bits: dh_prime.bits() })?;
    Ok((inner, auth_key))
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn unix_now() -> i32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i32).unwrap_or_default()
}

fn into_object(value: Value) -> Result<Object, Error> {
    match value {
        Value::Object(o) => Ok(*o),
        other => Err(Error::InvalidInnerData { detail: format!("expected an object, got {}", other.kind()) }),
    }
}

fn missing(call: &Call, field: &'static str) -> Error {
    Error::MissingField { owner: call.name.clone(), field }
}

fn missing_in(object: &Object, field: &'static str) -> Error {
    Error::MissingField { owner: object.name.clone(), field }
}

fn int128(call: &Call, field: &'static str) -> Result<[u8; 16], Error> {
    call.int128(field).ok_or_else(|| missing(call, field))
}

fn int128_of(object: &Object, field: &'static str) -> Result<[u8; 16], Error> {
    object.int128(field).ok_or_else(|| missing_in(object, field))
}

fn bytes<'c>(call: &'c Call, field: &'static str) -> Result<&'c [u8], Error> {
    call.bytes(field).ok_or_else(|| missing(call, field))
}

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else { Err(Error::InvalidNonce { got: *got, expected: *expected }) }
}

fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else { Err(Error::InvalidServerNonce { got: *got, expected: *expected }) }
}

/// Big-endian bytes without leading zeros.
pub(crate) fn min_be_bytes(v: u64) -> Vec<u8> {
    let b = v.to_be_bytes();
    let skip = b.iter().position(|&x| x != 0).unwrap_or(7);
    b[skip..].to_vec()
}

fn be_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_is_xor_of_nonce_prefixes() {
        let server_nonce = [0xffu8; 16];
        let new_nonce: [u8; 32] = std::array::from_fn(|i| i as u8);
        let expected = i64::from_le_bytes(std::array::from_fn(|i| 0xff ^ i as u8));
        assert_eq!(first_salt(&server_nonce, &new_nonce), expected);
    }

    #[test]
    fn short_rsa_block_is_rejected() {
        // n = 33: every decrypted block is a single byte.
        let tiny = RsaKeyPair::new("33", "3", "7").unwrap();
        assert!(open_inner_data(&tiny, &[0]).is_err());
        assert!(open_inner_data(&tiny, &[5]).is_err());
    }

    #[test]
    fn pq_is_eight_bytes() {
        for _ in 0..8 {
            let (p, q) = pq_factors().unwrap();
            assert!(p < q);
            assert_eq!(min_be_bytes(p * q).len(), 8);
            assert_eq!(pylon_crypto::factorize(p * q), Some((p, q)));
        }
    }

    #[test]
    fn big_endian_helpers() {
        assert_eq!(min_be_bytes(0x0102), vec![1, 2]);
        assert_eq!(min_be_bytes(0), vec![0]);
        assert_eq!(be_u64(&[1, 2]), Some(0x0102));
        assert_eq!(be_u64(&[]), None);
        assert_eq!(be_u64(&[0; 9]), None);
    }

    #[tokio::test]
    async fn unknown_calls_are_rejected() {
        let stores = Stores::in_memory(Default::default());
        let mut hs = Handshake::new();
        let err = hs.handle(&Call::new("ping").with("ping_id", 1i64), &stores).await.unwrap_err();
        assert_eq!(err, Error::UnexpectedCall { call: "ping".into(), stage: Stage::Init });

        let err = hs.handle(&Call::new("set_client_DH_params"), &stores).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedCall { stage: Stage::Init, .. }));
    }

    #[tokio::test]
    async fn req_pq_needs_a_key() {
        let stores = Stores::in_memory(Default::default());
        let mut hs = Handshake::new();
        let call = Call::new("req_pq_multi").with("nonce", [1u8; 16]);
        assert_eq!(hs.handle(&call, &stores).await, Err(Error::NoRsaKeys));
        assert_eq!(hs.stage(), Stage::Init);
    }
}
