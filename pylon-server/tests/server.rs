use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use pylon_crypto::rsa::RsaKeyPair;
use pylon_crypto::{AuthKey, Side};
use pylon_mtproto::client::{self, ClientSession, Outcome};
use pylon_mtproto::message_id::ClientMessageIds;
use pylon_mtproto::store::{RsaKeyRing, SessionStore, Stores};
use pylon_mtproto::transport::{self, AcceptOptions, ClientMode, FrameReader, FrameWriter, Framing};
use pylon_mtproto::{EncryptedMessage, PlainMessage, envelope, service};
use pylon_server::{HandlerError, RequestContext, RpcError, RpcRegistry, Server, ServerState, handler_fn};
use pylon_tl::{Call, Object, Schema, SchemaSet, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

const TEST_TL: &str = "
echoed text:string = Echoed;
---functions---
echo text:string = Echoed;
boom = Echoed;
slow = Echoed;
unregistered = Echoed;
count = int;
squares n:int = Vector<long>;
mislabeled = int;
";

fn key_pair() -> RsaKeyPair {
    let text = include_str!("../../testdata/rsa_2048.txt");
    let mut parts = text.split_whitespace();
    RsaKeyPair::new(parts.next().unwrap(), parts.next().unwrap(), parts.next().unwrap()).unwrap()
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::from_tl(TEST_TL).unwrap())
}

fn registry() -> RpcRegistry {
    RpcRegistry::new()
        .with(
            "echo",
            handler_fn(|_ctx, call| async move {
                let text = call.str("text").ok_or_else(|| RpcError::bad_request("TEXT_EMPTY"))?;
                Ok::<Value, HandlerError>(Object::new("echoed").with("text", text).into())
            }),
        )
        .with("count", handler_fn(|_ctx, _call| async move { Ok::<Value, HandlerError>(Value::Int(7)) }))
        .with(
            "squares",
            handler_fn(|_ctx, call| async move {
                let n = call.int("n").unwrap_or(0) as i64;
                Ok::<Value, HandlerError>(Value::Vector((1..=n).map(|i| Value::Long(i * i)).collect()))
            }),
        )
        .with("mislabeled", handler_fn(|_ctx, _call| async move { Ok::<Value, HandlerError>(Value::String("seven".into())) }))
        .with("boom", handler_fn(boom))
        .with(
            "slow",
            handler_fn(|_ctx, _call| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<Value, HandlerError>(Object::new("echoed").with("text", "late").into())
            }),
        )
}

async fn boom(_ctx: RequestContext, _call: Call) -> Result<Value, HandlerError> {
    panic!("kaboom")
}

fn server() -> (Arc<Server>, RsaKeyPair) {
    let pair = key_pair();
    let stores = Stores::in_memory(RsaKeyRing::new([pair.clone()]));
    let state = ServerState::new(stores, Some(schema()), registry()).unwrap();
    (Arc::new(Server::new(state, AcceptOptions::default())), pair)
}

/// The client end of one in-memory connection.
struct Peer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
    set: SchemaSet,
    msg_ids: ClientMessageIds,
    session: Option<ClientSession>,
    /// Decoded messages not yet claimed, with their message ids.
    inbox: VecDeque<(i64, Object)>,
}

impl Peer {
    async fn connect(server: &Arc<Server>, mode: ClientMode) -> Self {
        let (client_io, server_io) = duplex(1 << 20);
        let server = Arc::clone(server);
        tokio::spawn(async move {
            let _ = server.serve_connection(server_io).await;
        });
        let (r, w) = split(client_io);
        let (reader, writer) = transport::connect(r, w, mode).await.unwrap();
        Self {
            reader,
            writer,
            set: service::schema_set(Some(schema())).unwrap(),
            msg_ids: ClientMessageIds::new(),
            session: None,
            inbox: VecDeque::new(),
        }
    }

    async fn read_frame(&mut self) -> Option<Vec<u8>> {
        tokio::time::timeout(Duration::from_secs(10), self.reader.read_frame())
            .await
            .expect("timed out waiting for the server")
            .unwrap()
    }

    async fn plain_call(&mut self, call: Call) -> Object {
        let body = self.set.dump(&call.into()).unwrap();
        let frame = PlainMessage::new(self.msg_ids.next(), body).to_bytes();
        self.writer.write_frame(&frame).await.unwrap();

        let frame = self.read_frame().await.unwrap();
        let message = PlainMessage::from_bytes(&frame).unwrap();
        match self.set.load(&message.body).unwrap().0 {
            Value::Object(o) => *o,
            other => panic!("expected an object, got {}", other.kind()),
        }
    }

    async fn handshake(&mut self, pair: &RsaKeyPair) -> client::Finished {
        let (req, s1) = client::step1();
        let res_pq = self.plain_call(req).await;
        let (req, s2) = client::step2(s1, &res_pq, &[pair.public().clone()]).unwrap();
        let params = self.plain_call(req).await;
        let (req, s3) = client::step3(s2, &params).unwrap();
        let answer = self.plain_call(req).await;
        let Outcome::Done(done) = client::finish(s3, &answer).unwrap() else {
            panic!("unexpected retry");
        };
        self.session = Some(ClientSession::new(done.auth_key.clone(), done.first_salt));
        done
    }

    fn session(&mut self) -> &mut ClientSession {
        self.session.as_mut().expect("no session")
    }

    async fn send_raw(&mut self, body: &[u8], content_related: bool) -> i64 {
        let (frame, msg_id) = self.session().pack(body, content_related);
        self.writer.write_frame(&frame).await.unwrap();
        msg_id
    }

    async fn send(&mut self, value: impl Into<Value>) -> i64 {
        let value = value.into();
        let content_related = value.name().is_none_or(service::is_content_related);
        let body = self.set.dump(&value).unwrap();
        self.send_raw(&body, content_related).await
    }

    /// Reads one frame, unpacking containers into the inbox. Returns
    /// whether the frame was a container.
    async fn receive(&mut self) -> bool {
        let frame = self.read_frame().await.expect("connection closed");
        let message = self.session.as_ref().unwrap().unpack(&frame).unwrap();
        let (value, _) = self.set.load(&message.body).unwrap();
        let object = value.as_object().unwrap().clone();
        if object.name != "msg_container" {
            self.inbox.push_back((message.msg_id, object));
            return false;
        }
        for entry in object.vector("messages").unwrap() {
            let entry = entry.as_object().unwrap();
            let body = entry.bytes("body").unwrap();
            let (inner, _) = self.set.load(body).unwrap();
            self.inbox.push_back((entry.long("msg_id").unwrap(), inner.as_object().unwrap().clone()));
        }
        true
    }

    /// Waits for a message matching `pred`, leaving others in the inbox.
    async fn expect(&mut self, pred: impl Fn(&Object) -> bool) -> (i64, Object) {
        loop {
            if let Some(i) = self.inbox.iter().position(|(_, o)| pred(o)) {
                return self.inbox.remove(i).unwrap();
            }
            self.receive().await;
        }
    }

    async fn expect_named(&mut self, name: &str) -> Object {
        self.expect(|o| o.name == name).await.1
    }

    /// The decoded result of the `rpc_result` answering `req_msg_id`.
    /// The encoded `result` of the `rpc_result` answering `req_msg_id`.
    async fn expect_result_bytes(&mut self, req_msg_id: i64) -> Vec<u8> {
        let (_, result) = self.expect(|o| o.name == "rpc_result" && o.long("req_msg_id") == Some(req_msg_id)).await;
        result.get("result").and_then(Value::as_bytes).unwrap().to_vec()
    }

    async fn expect_result(&mut self, req_msg_id: i64) -> Object {
        let raw = self.expect_result_bytes(req_msg_id).await;
        let (value, _) = self.set.load(&raw).unwrap();
        value.as_object().unwrap().clone()
    }
}

fn ping(id: i64) -> Call {
    Call::new("ping").with("ping_id", id)
}

async fn ready_peer() -> (Arc<Server>, Peer, client::Finished) {
    let (server, pair) = server();
    let mut peer = Peer::connect(&server, ClientMode::Plain(Framing::Intermediate)).await;
    let done = peer.handshake(&pair).await;
    (server, peer, done)
}

#[tokio::test]
async fn handshake_registers_key_and_salt() {
    let (server, _peer, done) = ready_peer().await;
    let key_id = done.auth_key.id();
    let stored = server.state().stores.auth_keys.get(key_id).await.unwrap();
    assert_eq!(stored, done.auth_key);
    assert!(server.state().stores.salts.has_salt(key_id, done.first_salt).await.unwrap());
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (_server, mut peer, _) = ready_peer().await;
    let msg_id = peer.send(ping(42)).await;
    let pong = peer.expect_named("pong").await;
    assert_eq!(pong.long("msg_id"), Some(msg_id));
    assert_eq!(pong.long("ping_id"), Some(42));
}

#[tokio::test]
async fn first_message_creates_session() {
    let (server, mut peer, done) = ready_peer().await;
    let msg_id = peer.send(ping(1)).await;
    let created = peer.expect_named("new_session_created").await;
    assert_eq!(created.long("first_msg_id"), Some(msg_id));
    assert_eq!(created.long("server_salt"), Some(done.first_salt));

    let session_id = peer.session().session_id();
    assert!(server.state().stores.sessions.has(done.auth_key.id(), session_id).await.unwrap());
}

#[tokio::test]
async fn server_message_ids_are_tagged() {
    let (_server, mut peer, _) = ready_peer().await;
    peer.send(ping(1)).await;
    let (created_id, _) = peer.expect(|o| o.name == "new_session_created").await;
    let (pong_id, _) = peer.expect(|o| o.name == "pong").await;
    assert_eq!(created_id.rem_euclid(4), 3);
    assert_eq!(pong_id.rem_euclid(4), 1);
}

#[tokio::test]
async fn echo_rpc_returns_result() {
    let (_server, mut peer, _) = ready_peer().await;
    let msg_id = peer.send(Call::new("echo").with("text", "hello")).await;
    let result = peer.expect_result(msg_id).await;
    assert_eq!(result.name, "echoed");
    assert_eq!(result.str("text"), Some("hello"));
}

#[tokio::test]
async fn scalar_result_uses_declared_type() {
    let (_server, mut peer, _) = ready_peer().await;
    let msg_id = peer.send(Call::new("count")).await;
    assert_eq!(peer.expect_result_bytes(msg_id).await, 7i32.to_le_bytes());
}

#[tokio::test]
async fn vector_result_uses_declared_type() {
    let (_server, mut peer, _) = ready_peer().await;
    let msg_id = peer.send(Call::new("squares").with("n", 3i32)).await;
    let bytes = peer.expect_result_bytes(msg_id).await;

    let mut expected = Vec::new();
    expected.extend_from_slice(&0x1cb5c415u32.to_le_bytes());
    expected.extend_from_slice(&3i32.to_le_bytes());
    for square in [1i64, 4, 9] {
        expected.extend_from_slice(&square.to_le_bytes());
    }
    assert_eq!(bytes, expected);
}

#[tokio::test]
async fn result_of_wrong_type_is_rpc_error() {
    let (_server, mut peer, _) = ready_peer().await;
    let msg_id = peer.send(Call::new("mislabeled")).await;
    let error = peer.expect_result(msg_id).await;
    assert_eq!(error.name, "rpc_error");
    assert_eq!(error.int("error_code"), Some(500));
    assert_eq!(error.str("error_message"), Some("RESULT_TYPE_INVALID"));

    // The connection stays usable.
    let msg_id = peer.send(ping(5)).await;
    let pong = peer.expect_named("pong").await;
    assert_eq!(pong.long("msg_id"), Some(msg_id));
}

#[tokio::test]
async fn handler_error_becomes_rpc_error() {
    let (_server, mut peer, _) = ready_peer().await;
    let msg_id = peer.send(Call::new("echo")).await;
    let error = peer.expect_result(msg_id).await;
    assert_eq!(error.name, "rpc_error");
    assert_eq!(error.int("error_code"), Some(400));
    assert_eq!(error.str("error_message"), Some("TEXT_EMPTY"));
}

#[tokio::test]
async fn unregistered_function_is_method_invalid() {
    let (_server, mut peer, _) = ready_peer().await;
    let msg_id = peer.send(Call::new("unregistered")).await;
    let error = peer.expect_result(msg_id).await;
    assert_eq!(error.int("error_code"), Some(400));
    assert_eq!(error.str("error_message"), Some("METHOD_INVALID"));
}

#[tokio::test]
async fn panicking_handler_reports_code_zero() {
    let (_server, mut peer, _) = ready_peer().await;
    let msg_id = peer.send(Call::new("boom")).await;
    let error = peer.expect_result(msg_id).await;
    assert_eq!(error.name, "rpc_error");
    assert_eq!(error.int("error_code"), Some(0));

    // The connection survives.
    let msg_id = peer.send(ping(9)).await;
    let pong = peer.expect_named("pong").await;
    assert_eq!(pong.long("msg_id"), Some(msg_id));
}

#[tokio::test]
async fn undecodable_body_is_input_fetch_fail() {
    let (_server, mut peer, _) = ready_peer().await;
    let msg_id = peer.send_raw(&0xdeadbeefu32.to_le_bytes(), true).await;
    let error = peer.expect_result(msg_id).await;
    assert_eq!(error.str("error_message"), Some("INPUT_FETCH_FAIL"));
}

#[tokio::test]
async fn unacknowledged_messages_ride_along() {
    let (server, mut peer, done) = ready_peer().await;
    let first = peer.send(ping(1)).await;
    peer.expect(|o| o.name == "pong" && o.long("msg_id") == Some(first)).await;

    // Nothing acknowledged yet: the next answer is bundled with the
    // pending new_session_created and pong.
    peer.inbox.clear();
    let second = peer.send(ping(2)).await;
    assert!(peer.receive().await);
    let names: Vec<_> = peer.inbox.iter().map(|(_, o)| o.name.clone()).collect();
    assert_eq!(names, ["new_session_created", "pong", "pong"]);

    let ids: Vec<i64> = peer.inbox.drain(..).map(|(id, _)| id).collect();
    peer.send(service::msgs_ack(ids)).await;

    let (key_id, session_id) = (done.auth_key.id(), peer.session().session_id());
    for _ in 0..200 {
        if server.state().stores.acks.get_list(key_id, session_id).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.state().stores.acks.get_list(key_id, session_id).await.unwrap().is_empty());

    let third = peer.send(ping(3)).await;
    assert!(!peer.receive().await);
    let (_, pong) = peer.inbox.pop_front().unwrap();
    assert_eq!(pong.long("msg_id"), Some(third));
    assert_ne!(second, third);
}

#[tokio::test]
async fn wrong_salt_gets_bad_server_salt() {
    let (_server, mut peer, done) = ready_peer().await;
    peer.session().salt = done.first_salt ^ 0x5555;
    let msg_id = peer.send(ping(5)).await;
    let bad = peer.expect_named("bad_server_salt").await;
    assert_eq!(bad.long("bad_msg_id"), Some(msg_id));
    assert_eq!(bad.int("error_code"), Some(48));
    assert_eq!(bad.long("new_server_salt"), Some(done.first_salt));

    peer.session().salt = done.first_salt;
    let msg_id = peer.send(ping(6)).await;
    let pong = peer.expect_named("pong").await;
    assert_eq!(pong.long("msg_id"), Some(msg_id));
}

#[tokio::test]
async fn misaligned_message_id_is_rejected() {
    let (_server, mut peer, done) = ready_peer().await;
    let session_id = peer.session().session_id();
    let message = EncryptedMessage {
        salt: done.first_salt,
        session_id,
        msg_id: peer.msg_ids.next() + 2,
        seq_no: 1,
        body: peer.set.dump(&ping(7).into()).unwrap(),
    };
    let frame = message.encrypt(&done.auth_key, Side::Client);
    peer.writer.write_frame(&frame).await.unwrap();

    let notice = peer.expect_named("bad_msg_notification").await;
    assert_eq!(notice.long("bad_msg_id"), Some(message.msg_id));
    assert_eq!(notice.int("error_code"), Some(18));
}

#[tokio::test]
async fn unknown_key_gets_transport_error_and_close() {
    let (server, _pair) = server();
    let mut peer = Peer::connect(&server, ClientMode::Plain(Framing::Abridged)).await;
    peer.session = Some(ClientSession::new(AuthKey::from_bytes([7; 256]), 0));
    peer.send(ping(1)).await;

    let frame = peer.read_frame().await.unwrap();
    assert_eq!(transport::transport_error(&frame), Some(-404));
    assert_eq!(peer.read_frame().await, None);
}

#[tokio::test]
async fn container_entries_are_each_answered() {
    let (_server, mut peer, done) = ready_peer().await;
    let ids = [peer.msg_ids.next(), peer.msg_ids.next()];
    let entries = ids.iter().enumerate().map(|(i, &id)| {
        let body = peer.set.dump(&ping(100 + i as i64).into()).unwrap();
        service::message(id, 2 * i as i32 + 1, Value::Raw(body))
    });
    let container = service::msg_container(entries.collect::<Vec<_>>());
    let body = peer.set.dump(&container.into()).unwrap();
    assert_eq!(peer.session().salt, done.first_salt);
    peer.send_raw(&body, false).await;

    for id in ids {
        let pong = peer.expect(|o| o.name == "pong" && o.long("msg_id") == Some(id)).await.1;
        assert_eq!(pong.long("msg_id"), Some(id));
    }
}

#[tokio::test]
async fn gzip_packed_requests_are_inflated() {
    let (_server, mut peer, _) = ready_peer().await;
    let inner = peer.set.dump(&ping(77).into()).unwrap();
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&inner).unwrap();
    let packed = Object::new("gzip_packed").with("packed_data", gz.finish().unwrap());

    let body = peer.set.dump(&packed.into()).unwrap();
    peer.send_raw(&body, true).await;
    let pong = peer.expect_named("pong").await;
    assert_eq!(pong.long("ping_id"), Some(77));
}

#[tokio::test]
async fn future_salts_start_with_current() {
    let (_server, mut peer, done) = ready_peer().await;
    let msg_id = peer.send(Call::new("get_future_salts").with("num", 3)).await;
    let salts = peer.expect_named("future_salts").await;
    assert_eq!(salts.long("req_msg_id"), Some(msg_id));
    let list = salts.vector("salts").unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list[0].as_object().unwrap().long("salt"), Some(done.first_salt));
}

#[tokio::test]
async fn destroy_session_reports_existence() {
    let (_server, mut peer, _) = ready_peer().await;
    peer.send(ping(1)).await;
    peer.expect_named("pong").await;

    let current = peer.session().session_id();
    peer.send(Call::new("destroy_session").with("session_id", current)).await;
    let ok = peer.expect_named("destroy_session_ok").await;
    assert_eq!(ok.long("session_id"), Some(current));

    peer.send(Call::new("destroy_session").with("session_id", current ^ 1)).await;
    let none = peer.expect_named("destroy_session_none").await;
    assert_eq!(none.long("session_id"), Some(current ^ 1));
}

#[tokio::test]
async fn dropped_answer_cancels_running_rpc() {
    let (_server, mut peer, _) = ready_peer().await;
    let slow = peer.send(Call::new("slow")).await;
    let drop = peer.send(Call::new("rpc_drop_answer").with("req_msg_id", slow)).await;
    let answer = peer.expect_result(drop).await;
    assert_eq!(answer.name, "rpc_answer_dropped_running");

    let again = peer.send(Call::new("rpc_drop_answer").with("req_msg_id", slow)).await;
    let answer = peer.expect_result(again).await;
    assert_eq!(answer.name, "rpc_answer_unknown");
}

#[tokio::test]
async fn destroyed_key_is_forgotten() {
    let (server, mut peer, done) = ready_peer().await;
    peer.send(Call::new("destroy_auth_key")).await;

    // new_session_created comes first, encrypted.
    let frame = loop {
        let frame = peer.read_frame().await.unwrap();
        if envelope::is_plain(&frame) {
            break frame;
        }
    };
    let message = PlainMessage::from_bytes(&frame).unwrap();
    let (value, _) = peer.set.load(&message.body).unwrap();
    assert_eq!(value.name(), Some("destroy_auth_key_ok"));
    assert!(server.state().stores.auth_keys.get(done.auth_key.id()).await.is_err());
}

#[tokio::test]
async fn obfuscated_clients_are_served() {
    let (server, pair) = server();
    let mode = ClientMode::Obfuscated { framing: Framing::Intermediate, secret: None };
    let mut peer = Peer::connect(&server, mode).await;
    peer.handshake(&pair).await;
    let msg_id = peer.send(ping(11)).await;
    let pong = peer.expect_named("pong").await;
    assert_eq!(pong.long("msg_id"), Some(msg_id));
}
