use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use pylon_crypto::AuthKey;
use pylon_crypto::rsa::RsaKeyPair;
use pylon_mtproto::client::{self, Outcome};
use pylon_mtproto::handshake::{self, Handshake, Stage};
use pylon_mtproto::service;
use pylon_mtproto::store::{AuthKeyStore, MemoryAuthKeys, RsaKeyRing, Stores, StoreError};
use pylon_tl::{Call, Object, SchemaSet, Value};

fn key_pair() -> RsaKeyPair {
    let text = include_str!("../../testdata/rsa_2048.txt");
    let mut parts = text.split_whitespace();
    RsaKeyPair::new(parts.next().unwrap(), parts.next().unwrap(), parts.next().unwrap()).unwrap()
}

fn stores() -> (Stores, RsaKeyPair) {
    let pair = key_pair();
    (Stores::in_memory(RsaKeyRing::new([pair.clone()])), pair)
}

fn set() -> SchemaSet {
    service::schema_set(None).unwrap()
}

/// Sends `call` through the wire encoding and returns the decoded answer.
async fn exchange(server: &mut Handshake, stores: &Stores, call: Call) -> Result<Object, handshake::Error> {
    let set = set();
    let bytes = set.dump(&call.into()).unwrap();
    let (Value::Call(call), used) = set.load(&bytes).unwrap() else {
        panic!("not a call");
    };
    assert_eq!(used, bytes.len());

    let answer = server.handle(&call, stores).await?;
    let bytes = set.dump(&answer.into()).unwrap();
    let (Value::Object(answer), _) = set.load(&bytes).unwrap() else {
        panic!("not an object");
    };
    Ok(*answer)
}

async fn run_to_step3(server: &mut Handshake, stores: &Stores, pair: &RsaKeyPair) -> (Call, client::Step3) {
    let (req, s1) = client::step1();
    let res_pq = exchange(server, stores, req).await.unwrap();
    assert_eq!(server.stage(), Stage::NoncesIssued);

    let (req, s2) = client::step2(s1, &res_pq, &[pair.public().clone()]).unwrap();
    let params = exchange(server, stores, req).await.unwrap();
    assert_eq!(params.name, "server_DH_params_ok");
    assert_eq!(server.stage(), Stage::DhParamsSent);

    client::step3(s2, &params).unwrap()
}

#[tokio::test]
async fn full_exchange_establishes_a_key() {
    let (stores, pair) = stores();
    let mut server = Handshake::new();
    let (req, s3) = run_to_step3(&mut server, &stores, &pair).await;

    let answer = exchange(&mut server, &stores, req).await.unwrap();
    assert_eq!(answer.name, "dh_gen_ok");
    let Outcome::Done(done) = client::finish(s3, &answer).unwrap() else {
        panic!("expected dh_gen_ok");
    };

    assert_eq!(server.stage(), Stage::Established);
    assert_eq!(server.auth_key_id(), Some(done.auth_key.id()));
    assert_eq!(stores.auth_keys.get(done.auth_key.id()).await.unwrap(), done.auth_key);
    assert!(stores.salts.has_salt(done.auth_key.id(), done.first_salt).await.unwrap());
    assert!(done.time_offset.abs() <= 1);
}

#[tokio::test]
async fn wrong_factors_get_params_fail() {
    let (stores, pair) = stores();
    let mut server = Handshake::new();

    let (req, s1) = client::step1();
    let res_pq = exchange(&mut server, &stores, req).await.unwrap();
    let (mut req, s2) = client::step2(s1, &res_pq, &[pair.public().clone()]).unwrap();
    req.set("p", vec![0u8, 0, 0, 7]);

    let answer = exchange(&mut server, &stores, req).await.unwrap();
    assert_eq!(answer.name, "server_DH_params_fail");
    assert_eq!(server.stage(), Stage::Init);
    assert_eq!(client::step3(s2, &answer).unwrap_err(), client::Error::DhParamsFail);
}

#[tokio::test]
async fn corrupted_legacy_inner_data_is_rejected() {
    let (stores, pair) = stores();
    let mut server = Handshake::new();

    let nonce = [3u8; 16];
    let res_pq = exchange(&mut server, &stores, Call::new("req_pq").with("nonce", nonce)).await.unwrap();
    let server_nonce = res_pq.int128("server_nonce").unwrap();
    let pq = res_pq.bytes("pq").unwrap().to_vec();
    let (p, q) = pylon_crypto::factorize(u64::from_be_bytes(pq.clone().try_into().unwrap())).unwrap();
    let p = (p as u32).to_be_bytes().to_vec();
    let q = (q as u32).to_be_bytes().to_vec();

    let inner = Object::new("p_q_inner_data")
        .with("pq", pq)
        .with("p", p.clone())
        .with("q", q.clone())
        .with("nonce", nonce)
        .with("server_nonce", server_nonce)
        .with("new_nonce", [9u8; 32]);
    let inner = set().dump(&inner.into()).unwrap();

    let mut data = Vec::with_capacity(255);
    data.extend_from_slice(&pylon_crypto::sha1!(&inner));
    data.extend_from_slice(&inner);
    data.resize(255, 0x5a);
    data[0] ^= 0xff;
    let encrypted = pair.public().encrypt(&data).unwrap();

    let req = Call::new("req_DH_params")
        .with("nonce", nonce)
        .with("server_nonce", server_nonce)
        .with("p", p)
        .with("q", q)
        .with("public_key_fingerprint", pair.fingerprint())
        .with("encrypted_data", encrypted);
    assert_eq!(
        exchange(&mut server, &stores, req).await.unwrap_err(),
        handshake::Error::InnerDataHashMismatch
    );
}

#[tokio::test]
async fn unknown_fingerprint_is_rejected() {
    let (stores, pair) = stores();
    let mut server = Handshake::new();
    let (req, s1) = client::step1();
    let res_pq = exchange(&mut server, &stores, req).await.unwrap();
    let (mut req, _) = client::step2(s1, &res_pq, &[pair.public().clone()]).unwrap();
    req.set("public_key_fingerprint", 1i64);

    assert_eq!(
        exchange(&mut server, &stores, req).await.unwrap_err(),
        handshake::Error::UnknownFingerprint { fingerprint: 1 }
    );
}

/// Claims the first key it is asked about already exists.
#[derive(Default)]
struct CollideOnce {
    inner: MemoryAuthKeys,
    collided: AtomicBool,
}

#[async_trait]
impl AuthKeyStore for CollideOnce {
    async fn set(&self, key: AuthKey) -> Result<(), StoreError> {
        self.inner.set(key).await
    }

    async fn has(&self, key_id: u64) -> Result<bool, StoreError> {
        if !self.collided.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }
        self.inner.has(key_id).await
    }

    async fn get(&self, key_id: u64) -> Result<AuthKey, StoreError> {
        self.inner.get(key_id).await
    }

    async fn delete(&self, key_id: u64) -> Result<(), StoreError> {
        self.inner.delete(key_id).await
    }
}

fn colliding_stores() -> (Stores, RsaKeyPair) {
    let (stores, pair) = stores();
    (Stores { auth_keys: Arc::new(CollideOnce::default()), ..stores }, pair)
}

#[tokio::test]
async fn key_collision_asks_for_retry() {
    let (stores, pair) = colliding_stores();
    let mut server = Handshake::new();
    let (req, s3) = run_to_step3(&mut server, &stores, &pair).await;

    let answer = exchange(&mut server, &stores, req).await.unwrap();
    assert_eq!(answer.name, "dh_gen_retry");
    assert_eq!(server.stage(), Stage::DhParamsSent);
    let Outcome::Retry(s3) = client::finish(s3, &answer).unwrap() else {
        panic!("expected dh_gen_retry");
    };

    let (req, s3) = client::retry(s3).unwrap();
    let answer = exchange(&mut server, &stores, req).await.unwrap();
    assert_eq!(answer.name, "dh_gen_ok");
    assert!(matches!(client::finish(s3, &answer).unwrap(), Outcome::Done(_)));
    assert_eq!(server.stage(), Stage::Established);
}

#[tokio::test]
async fn wrong_retry_id_fails() {
    let (stores, pair) = colliding_stores();
    let mut server = Handshake::new();
    let (req, s3) = run_to_step3(&mut server, &stores, &pair).await;

    let answer = exchange(&mut server, &stores, req).await.unwrap();
    let Outcome::Retry(s3) = client::finish(s3, &answer).unwrap() else {
        panic!("expected dh_gen_retry");
    };

    let (req, s3) = client::retry_with(s3, 12345).unwrap();
    let answer = exchange(&mut server, &stores, req).await.unwrap();
    assert_eq!(answer.name, "dh_gen_fail");
    assert_eq!(client::finish(s3, &answer).unwrap_err(), client::Error::DhGenFail);
    assert_eq!(server.stage(), Stage::Init);
}

#[tokio::test]
async fn set_client_dh_params_before_req_dh_params_is_rejected() {
    let (stores, _) = stores();
    let mut server = Handshake::new();
    let call = Call::new("set_client_DH_params")
        .with("nonce", [0u8; 16])
        .with("server_nonce", [0u8; 16])
        .with("encrypted_data", vec![0u8; 16]);
    assert!(matches!(
        exchange(&mut server, &stores, call).await,
        Err(handshake::Error::UnexpectedCall { stage: Stage::Init, .. })
    ));
}
