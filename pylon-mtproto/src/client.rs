//! Sans-IO client side of the auth key exchange, and a client envelope
//! session.
//!
//! # Flow
//!
//! ```text
//! let (req, s1) = client::step1();
//! // send req, receive resPQ
//! let (req, s2) = client::step2(s1, &res_pq, &keys)?;
//! // send req, receive server_DH_params_ok
//! let (req, s3) = client::step3(s2, &params)?;
//! // send req, receive dh_gen_*
//! match client::finish(s3, &answer)? {
//!     Outcome::Done(done) => { /* done.auth_key is ready */ }
//!     Outcome::Retry(s3) => { let (req, s3) = client::retry(s3)?; /* ... */ }
//! }
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use pylon_crypto::rsa::{self, PublicKey};
use pylon_crypto::{AuthKey, Side, aes, factorize, generate_key_data_from_nonce, prime, random_array};
use pylon_tl::{Call, Object, Value, deserialize};

use crate::envelope::{self, EncryptedMessage};
use crate::handshake::{first_salt, min_be_bytes};
use crate::message_id::ClientMessageIds;
use crate::service;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    UnexpectedResponse { got: String, expected: &'static str },
    MissingField { owner: String, field: &'static str },
    InvalidNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidServerNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize { size: usize },
    Factorization { pq: u64 },
    UnknownFingerprints { fingerprints: Vec<i64> },
    Rsa(rsa::Error),
    DhParamsFail,
    EncryptedResponseNotPadded { len: usize },
    InvalidDhInnerData { error: deserialize::Error },
    InvalidAnswerHash,
    DhValueOutOfRange,
    InvalidNewNonceHash { got: [u8; 16], expected: [u8; 16] },
    DhGenFail,
    Encode(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedResponse { got, expected } => write!(f, "expected {expected}, got `{got}`"),
            Self::MissingField { owner, field } => write!(f, "`{owner}` is missing `{field}`"),
            Self::InvalidNonce { .. } => write!(f, "nonce mismatch"),
            Self::InvalidServerNonce { .. } => write!(f, "server_nonce mismatch"),
            Self::InvalidPqSize { size } => write!(f, "pq size {size} invalid (expected 8)"),
            Self::Factorization { pq } => write!(f, "could not factorize pq={pq}"),
            Self::UnknownFingerprints { fingerprints } => write!(f, "no known fingerprint in {fingerprints:?}"),
            Self::Rsa(e) => write!(f, "rsa: {e}"),
            Self::DhParamsFail => write!(f, "server returned DH params failure"),
            Self::EncryptedResponseNotPadded { len } => {
                write!(f, "encrypted answer len {len} is not 16-byte aligned")
            }
            Self::InvalidDhInnerData { error } => write!(f, "DH inner data deserialization error: {error}"),
            Self::InvalidAnswerHash => write!(f, "answer hash mismatch"),
            Self::DhValueOutOfRange => write!(f, "DH value out of range"),
            Self::InvalidNewNonceHash { .. } => write!(f, "new nonce hash mismatch"),
            Self::DhGenFail => write!(f, "DH gen failed"),
            Self::Encode(e) => write!(f, "encode: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Self::Rsa(e)
    }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// State after step 1.
#[derive(Debug)]
pub struct Step1 {
    nonce: [u8; 16],
}

/// State after step 2.
#[derive(Debug)]
pub struct Step2 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
}

/// State after step 3; also what a retry starts from.
#[derive(Debug)]
pub struct Step3 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    g: BigUint,
    g_a: BigUint,
    dh_prime: BigUint,
    gab: BigUint,
    time_offset: i32,
}

/// The result of a successful exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    pub auth_key: AuthKey,
    /// Clock skew in seconds relative to the server.
    pub time_offset: i32,
    pub first_salt: i64,
}

/// What the server made of `set_client_DH_params`.
#[derive(Debug)]
pub enum Outcome {
    Done(Finished),
    /// The key collided with an existing one; call [`retry`].
    Retry(Step3),
}

// ─── Step 1: req_pq_multi ────────────────────────────────────────────────────

pub fn step1() -> (Call, Step1) {
    do_step1(random_array())
}

fn do_step1(nonce: [u8; 16]) -> (Call, Step1) {
    (Call::new("req_pq_multi").with("nonce", nonce), Step1 { nonce })
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Processes `resPQ` and builds `req_DH_params`, encrypting the inner data
/// with RSA_PAD for the first of `keys` the server offers.
pub fn step2(data: Step1, response: &Object, keys: &[PublicKey]) -> Result<(Call, Step2), Error> {
    let Step1 { nonce } = data;
    expect(response, "resPQ")?;
    check_nonce(&int128(response, "nonce")?, &nonce)?;
    let server_nonce = int128(response, "server_nonce")?;

    let pq_bytes = response.bytes("pq").ok_or_else(|| missing(response, "pq"))?;
    let pq_bytes: [u8; 8] = pq_bytes.try_into().map_err(|_| Error::InvalidPqSize { size: pq_bytes.len() })?;
    let pq = u64::from_be_bytes(pq_bytes);
    let (p, q) = factorize(pq).ok_or(Error::Factorization { pq })?;

    let offered: Vec<i64> = response
        .vector("server_public_key_fingerprints")
        .ok_or_else(|| missing(response, "server_public_key_fingerprints"))?
        .iter()
        .filter_map(Value::as_long)
        .collect();
    let key = offered
        .iter()
        .find_map(|&fp| keys.iter().find(|k| k.fingerprint() == fp))
        .ok_or_else(|| Error::UnknownFingerprints { fingerprints: offered.clone() })?;

    let new_nonce: [u8; 32] = random_array();
    let inner = Object::new("p_q_inner_data")
        .with("pq", pq_bytes.to_vec())
        .with("p", min_be_bytes(p))
        .with("q", min_be_bytes(q))
        .with("nonce", nonce)
        .with("server_nonce", server_nonce)
        .with("new_nonce", new_nonce);
    let inner = dump(inner)?;
    let encrypted = rsa::encrypt_hashed(&inner, key, &random_array())?;

    let call = Call::new("req_DH_params")
        .with("nonce", nonce)
        .with("server_nonce", server_nonce)
        .with("p", min_be_bytes(p))
        .with("q", min_be_bytes(q))
        .with("public_key_fingerprint", key.fingerprint())
        .with("encrypted_data", encrypted);
    Ok((call, Step2 { nonce, server_nonce, new_nonce }))
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Processes `Server_DH_Params` and builds `set_client_DH_params`.
pub fn step3(data: Step2, response: &Object) -> Result<(Call, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce } = data;
    check_nonce(&int128(response, "nonce")?, &nonce)?;
    check_server_nonce(&int128(response, "server_nonce")?, &server_nonce)?;

    if response.name == "server_DH_params_fail" {
        let digest = pylon_crypto::sha1!(&new_nonce);
        let mut expected = [0u8; 16];
        expected.copy_from_slice(&digest[4..]);
        check_new_nonce_hash(&int128(response, "new_nonce_hash")?, &expected)?;
        return Err(Error::DhParamsFail);
    }
    expect(response, "server_DH_params_ok")?;

    let mut answer = response
        .bytes("encrypted_answer")
        .ok_or_else(|| missing(response, "encrypted_answer"))?
        .to_vec();
    if answer.len() < 32 || answer.len() % 16 != 0 {
        return Err(Error::EncryptedResponseNotPadded { len: answer.len() });
    }
    let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut answer, &key, &iv);

    let (inner, used) = load(&answer[20..])?;
    if pylon_crypto::sha1!(&answer[20..20 + used]) != answer[..20] {
        return Err(Error::InvalidAnswerHash);
    }
    expect(&inner, "server_DH_inner_data")?;
    check_nonce(&int128(&inner, "nonce")?, &nonce)?;
    check_server_nonce(&int128(&inner, "server_nonce")?, &server_nonce)?;

    let g = inner.int("g").ok_or_else(|| missing(&inner, "g"))?;
    let dh_prime = BigUint::from_bytes_be(inner.bytes("dh_prime").ok_or_else(|| missing(&inner, "dh_prime"))?);
    let g_a = BigUint::from_bytes_be(inner.bytes("g_a").ok_or_else(|| missing(&inner, "g_a"))?);
    let server_time = inner.int("server_time").ok_or_else(|| missing(&inner, "server_time"))?;
    if !prime::check_dh_value(&g_a, &dh_prime) {
        return Err(Error::DhValueOutOfRange);
    }

    let partial = Step3 {
        nonce,
        server_nonce,
        new_nonce,
        g: BigUint::from(g.max(0) as u32),
        g_a,
        dh_prime,
        gab: BigUint::default(),
        time_offset: server_time - unix_now(),
    };
    client_dh(partial, 0)
}

/// Answers `dh_gen_retry` with a fresh `g_b` and the previous key's aux hash.
pub fn retry(data: Step3) -> Result<(Call, Step3), Error> {
    let retry_id = previous_aux_hash(&data);
    retry_with(data, retry_id)
}

/// Like [`retry`] with an explicit `retry_id`.
pub fn retry_with(data: Step3, retry_id: i64) -> Result<(Call, Step3), Error> {
    client_dh(data, retry_id)
}

fn previous_aux_hash(data: &Step3) -> i64 {
    AuthKey::from_shared_secret(&data.gab).map_or(0, |k| i64::from_le_bytes(k.aux_hash()))
}

fn client_dh(mut data: Step3, retry_id: i64) -> Result<(Call, Step3), Error> {
    let b = BigUint::from_bytes_be(&random_array::<256>());
    let g_b = data.g.modpow(&b, &data.dh_prime);
    if !prime::check_dh_value(&g_b, &data.dh_prime) {
        return Err(Error::DhValueOutOfRange);
    }
    data.gab = data.g_a.modpow(&b, &data.dh_prime);

    let inner = Object::new("client_DH_inner_data")
        .with("nonce", data.nonce)
        .with("server_nonce", data.server_nonce)
        .with("retry_id", retry_id)
        .with("g_b", g_b.to_bytes_be());
    let inner = dump(inner)?;

    let mut hashed = Vec::with_capacity(20 + inner.len() + 16);
    hashed.extend_from_slice(&pylon_crypto::sha1!(&inner));
    hashed.extend_from_slice(&inner);
    let pad = (16 - hashed.len() % 16) % 16;
    hashed.extend_from_slice(&random_array::<16>()[..pad]);

    let (key, iv) = generate_key_data_from_nonce(&data.server_nonce, &data.new_nonce);
    aes::ige_encrypt(&mut hashed, &key, &iv);

    let call = Call::new("set_client_DH_params")
        .with("nonce", data.nonce)
        .with("server_nonce", data.server_nonce)
        .with("encrypted_data", hashed);
    Ok((call, data))
}

// ─── finish ──────────────────────────────────────────────────────────────────

/// Checks the `dh_gen_*` answer against the key this client computed.
pub fn finish(data: Step3, response: &Object) -> Result<Outcome, Error> {
    let (field, number) = match response.name.as_str() {
        "dh_gen_ok" => ("new_nonce_hash1", 1),
        "dh_gen_retry" => ("new_nonce_hash2", 2),
        "dh_gen_fail" => ("new_nonce_hash3", 3),
        other => return Err(Error::UnexpectedResponse { got: other.to_owned(), expected: "dh_gen_*" }),
    };
    check_nonce(&int128(response, "nonce")?, &data.nonce)?;
    check_server_nonce(&int128(response, "server_nonce")?, &data.server_nonce)?;

    let auth_key = AuthKey::from_shared_secret(&data.gab).ok_or(Error::DhValueOutOfRange)?;
    let got = response.int128(field).ok_or_else(|| missing(response, field))?;
    check_new_nonce_hash(&got, &auth_key.calc_new_nonce_hash(&data.new_nonce, number))?;

    match number {
        1 => Ok(Outcome::Done(Finished {
            first_salt: first_salt(&data.server_nonce, &data.new_nonce),
            time_offset: data.time_offset,
            auth_key,
        })),
        2 => Ok(Outcome::Retry(data)),
        _ => Err(Error::DhGenFail),
    }
}

// ─── Envelopes ───────────────────────────────────────────────────────────────

/// Client end of an encrypted session: packs requests as [`Side::Client`]
/// and opens server messages as [`Side::Server`].
#[derive(Debug)]
pub struct ClientSession {
    auth_key: AuthKey,
    session_id: i64,
    /// Salt placed in outgoing messages.
    pub salt: i64,
    sequence: i32,
    msg_ids: ClientMessageIds,
}

impl ClientSession {
    pub fn new(auth_key: AuthKey, salt: i64) -> Self {
        Self::with_session_id(auth_key, salt, i64::from_le_bytes(random_array()))
    }

    pub fn with_session_id(auth_key: AuthKey, salt: i64, session_id: i64) -> Self {
        Self { auth_key, session_id, salt, sequence: 0, msg_ids: ClientMessageIds::new() }
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence += 1;
            n
        } else {
            self.sequence * 2
        }
    }

    /// Encrypts an already-serialized body; returns the frame and its msg_id.
    pub fn pack(&mut self, body: &[u8], content_related: bool) -> (Vec<u8>, i64) {
        let msg_id = self.msg_ids.next();
        let seq_no = self.next_seq_no(content_related);
        let message = EncryptedMessage {
            salt: self.salt,
            session_id: self.session_id,
            msg_id,
            seq_no,
            body: body.to_vec(),
        };
        (message.encrypt(&self.auth_key, Side::Client), msg_id)
    }

    /// Opens a server frame.
    pub fn unpack(&self, frame: &[u8]) -> Result<EncryptedMessage, envelope::Error> {
        EncryptedMessage::decrypt(frame, &self.auth_key, Side::Server)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn unix_now() -> i32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i32).unwrap_or_default()
}

fn dump(object: Object) -> Result<Vec<u8>, Error> {
    let set = service::schema_set(None).map_err(|e| Error::Encode(e.to_string()))?;
    set.dump(&object.into()).map_err(|e| Error::Encode(e.to_string()))
}

fn load(bytes: &[u8]) -> Result<(Object, usize), Error> {
    let set = service::schema_set(None).map_err(|e| Error::Encode(e.to_string()))?;
    match set.load(bytes) {
        Ok((Value::Object(o), used)) => Ok((*o, used)),
        Ok((other, _)) => Err(Error::UnexpectedResponse { got: other.kind().to_owned(), expected: "object" }),
        Err(error) => Err(Error::InvalidDhInnerData { error }),
    }
}

fn expect(object: &Object, name: &'static str) -> Result<(), Error> {
    if object.name == name {
        Ok(())
    } else {
        Err(Error::UnexpectedResponse { got: object.name.clone(), expected: name })
    }
}

fn missing(object: &Object, field: &'static str) -> Error {
    Error::MissingField { owner: object.name.clone(), field }
}

fn int128(object: &Object, field: &'static str) -> Result<[u8; 16], Error> {
    object.int128(field).ok_or_else(|| missing(object, field))
}

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else { Err(Error::InvalidNonce { got: *got, expected: *expected }) }
}

fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else { Err(Error::InvalidServerNonce { got: *got, expected: *expected }) }
}

fn check_new_nonce_hash(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else { Err(Error::InvalidNewNonceHash { got: *got, expected: *expected }) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step1_builds_req_pq_multi() {
        let (call, state) = do_step1([5; 16]);
        assert_eq!(call.name, "req_pq_multi");
        assert_eq!(call.int128("nonce"), Some([5; 16]));
        assert_eq!(state.nonce, [5; 16]);
    }

    #[test]
    fn step2_rejects_foreign_nonce() {
        let (_, state) = do_step1([1; 16]);
        let res_pq = Object::new("resPQ")
            .with("nonce", [2u8; 16])
            .with("server_nonce", [3u8; 16])
            .with("pq", 1470626929934143021u64.to_be_bytes().to_vec())
            .with("server_public_key_fingerprints", Value::vector([1i64]));
        assert!(matches!(step2(state, &res_pq, &[]), Err(Error::InvalidNonce { .. })));
    }

    #[test]
    fn step2_needs_a_known_key() {
        let (_, state) = do_step1([1; 16]);
        let res_pq = Object::new("resPQ")
            .with("nonce", [1u8; 16])
            .with("server_nonce", [3u8; 16])
            .with("pq", 1470626929934143021u64.to_be_bytes().to_vec())
            .with("server_public_key_fingerprints", Value::vector([1i64]));
        assert_eq!(
            step2(state, &res_pq, &[]).unwrap_err(),
            Error::UnknownFingerprints { fingerprints: vec![1] }
        );
    }

    #[test]
    fn seq_numbers() {
        let mut session = ClientSession::with_session_id(AuthKey::from_bytes([1; 256]), 0, 9);
        assert_eq!(session.next_seq_no(false), 0);
        assert_eq!(session.next_seq_no(true), 1);
        assert_eq!(session.next_seq_no(true), 3);
        assert_eq!(session.next_seq_no(false), 4);
    }
}
