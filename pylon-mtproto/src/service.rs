//! The MTProto service schema and helpers for building its objects.
//!
//! Two constructors get custom codecs:
//!
//! * `message` carries its body as [`Value::Raw`] so each entry of a
//!   container can be decoded (and fail) on its own.
//! * `rpc_result` writes an already-encoded result verbatim and reads the
//!   rest of the message back as raw bytes, since the result type depends
//!   on the request it answers.

use std::sync::{Arc, OnceLock};

use pylon_tl::deserialize::{self, Error};
use pylon_tl::{
    Cursor, CustomCodec, Deserializable, EncodeError, Engine, Object, Overrides, Schema, SchemaError,
    SchemaSet, Serializable, Value,
};

/// Service constructors and functions exchanged before and alongside user RPCs.
pub const SERVICE_TL: &str = "
resPQ#05162463 nonce:int128 server_nonce:int128 pq:bytes server_public_key_fingerprints:Vector<long> = ResPQ;

p_q_inner_data#83c95aec pq:bytes p:bytes q:bytes nonce:int128 server_nonce:int128 new_nonce:int256 = P_Q_inner_data;
p_q_inner_data_dc#a9f55f95 pq:bytes p:bytes q:bytes nonce:int128 server_nonce:int128 new_nonce:int256 dc:int = P_Q_inner_data;
p_q_inner_data_temp#3c6a84d4 pq:bytes p:bytes q:bytes nonce:int128 server_nonce:int128 new_nonce:int256 expires_in:int = P_Q_inner_data;
p_q_inner_data_temp_dc#56fddf88 pq:bytes p:bytes q:bytes nonce:int128 server_nonce:int128 new_nonce:int256 dc:int expires_in:int = P_Q_inner_data;

server_DH_params_fail#79cb045d nonce:int128 server_nonce:int128 new_nonce_hash:int128 = Server_DH_Params;
server_DH_params_ok#d0e8075c nonce:int128 server_nonce:int128 encrypted_answer:bytes = Server_DH_Params;

server_DH_inner_data#b5890dba nonce:int128 server_nonce:int128 g:int dh_prime:bytes g_a:bytes server_time:int = Server_DH_inner_data;
client_DH_inner_data#6643b654 nonce:int128 server_nonce:int128 retry_id:long g_b:bytes = Client_DH_Inner_Data;

dh_gen_ok#3bcbf734 nonce:int128 server_nonce:int128 new_nonce_hash1:int128 = Set_client_DH_params_answer;
dh_gen_retry#46dc1fb9 nonce:int128 server_nonce:int128 new_nonce_hash2:int128 = Set_client_DH_params_answer;
dh_gen_fail#a69dae02 nonce:int128 server_nonce:int128 new_nonce_hash3:int128 = Set_client_DH_params_answer;

destroy_auth_key_ok#f660e1d4 = DestroyAuthKeyRes;
destroy_auth_key_none#0a9f2259 = DestroyAuthKeyRes;
destroy_auth_key_fail#ea109b13 = DestroyAuthKeyRes;

msgs_ack#62d6b459 msg_ids:Vector<long> = MsgsAck;

bad_msg_notification#a7eff811 bad_msg_id:long bad_msg_seqno:int error_code:int = BadMsgNotification;
bad_server_salt#edab447b bad_msg_id:long bad_msg_seqno:int error_code:int new_server_salt:long = BadMsgNotification;

rpc_result#f35c6d01 req_msg_id:long result:Object = RpcResult;
rpc_error#2144ca19 error_code:int error_message:string = RpcError;

rpc_answer_unknown#5e2ad36e = RpcDropAnswer;
rpc_answer_dropped_running#cd78e586 = RpcDropAnswer;
rpc_answer_dropped#a43ad8b7 msg_id:long seq_no:int bytes:int = RpcDropAnswer;

future_salt#0949d9dc valid_since:int valid_until:int salt:long = FutureSalt;
future_salts#ae500895 req_msg_id:long now:int salts:vector<future_salt> = FutureSalts;

pong#347773c5 msg_id:long ping_id:long = Pong;

destroy_session_ok#e22045fc session_id:long = DestroySessionRes;
destroy_session_none#62d350c9 session_id:long = DestroySessionRes;

new_session_created#9ec20908 first_msg_id:long unique_id:long server_salt:long = NewSession;

msg_container#73f1f8dc messages:vector<%Message> = MessageContainer;
message msg_id:long seqno:int bytes:int body:Object = Message;

gzip_packed#3072cfa1 packed_data:bytes = Object;

---functions---

req_pq#60469778 nonce:int128 = ResPQ;
req_pq_multi#be7e8ef1 nonce:int128 = ResPQ;
req_DH_params#d712e4be nonce:int128 server_nonce:int128 p:bytes q:bytes public_key_fingerprint:long encrypted_data:bytes = Server_DH_Params;
set_client_DH_params#f5045f1f nonce:int128 server_nonce:int128 encrypted_data:bytes = Set_client_DH_params_answer;

rpc_drop_answer#58e4a740 req_msg_id:long = RpcDropAnswer;
get_future_salts#b921bd04 num:int = FutureSalts;
ping#7abe77ec ping_id:long = Pong;
ping_delay_disconnect#f3427b8c ping_id:long disconnect_delay:int = Pong;
destroy_session#e7512126 session_id:long = DestroySessionRes;
destroy_auth_key#d1435160 = DestroyAuthKeyRes;
";

pub const MESSAGE_ID: u32 = 0x5bb8e511;
pub const MSG_CONTAINER_ID: u32 = 0x73f1f8dc;
pub const MSGS_ACK_ID: u32 = 0x62d6b459;
pub const RPC_RESULT_ID: u32 = 0xf35c6d01;
pub const GZIP_PACKED_ID: u32 = 0x3072cfa1;

/// Functions a client may call over an unencrypted message.
pub const HANDSHAKE_FUNCTIONS: [&str; 4] = ["req_pq", "req_pq_multi", "req_DH_params", "set_client_DH_params"];

/// The parsed [`SERVICE_TL`], built once per process.
pub fn service_schema() -> Result<Arc<Schema>, SchemaError> {
    static SCHEMA: OnceLock<Result<Arc<Schema>, SchemaError>> = OnceLock::new();
    SCHEMA.get_or_init(|| Schema::from_tl(SERVICE_TL).map(Arc::new)).clone()
}

/// Codecs for `message` and `rpc_result`.
pub fn service_overrides() -> Overrides {
    Overrides::new()
        .with(MESSAGE_ID, Arc::new(MessageCodec))
        .with(RPC_RESULT_ID, Arc::new(RpcResultCodec))
}

/// The service schema followed by `user`, sharing [`service_overrides`].
///
/// Top-level values are tried against the service schema first.
pub fn schema_set(user: Option<Arc<Schema>>) -> Result<SchemaSet, SchemaError> {
    let mut schemas = vec![service_schema()?];
    schemas.extend(user);
    Ok(SchemaSet::new(schemas).with_overrides(service_overrides()))
}

/// Whether `name` is a function declared by the service schema.
pub fn is_service_function(name: &str) -> bool {
    service_schema().is_ok_and(|s| s.function_by_name(name).is_some())
}

/// Messages that must be acknowledged and take an odd `seq_no`.
pub fn is_content_related(name: &str) -> bool {
    !matches!(name, "msgs_ack" | "msg_container" | "gzip_packed")
}

fn missing(owner: &str, field: &str) -> EncodeError {
    EncodeError::MissingField { owner: owner.into(), field: field.into() }
}

fn body_bytes(engine: &Engine<'_>, value: &Value) -> Result<Vec<u8>, EncodeError> {
    match value {
        Value::Raw(bytes) => Ok(bytes.clone()),
        other => engine.dump(other),
    }
}

struct MessageCodec;

impl CustomCodec for MessageCodec {
    fn dump(&self, engine: &Engine<'_>, object: &Object, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let msg_id = object.long("msg_id").ok_or_else(|| missing("message", "msg_id"))?;
        let seqno = object.int("seqno").ok_or_else(|| missing("message", "seqno"))?;
        let body = object.get("body").ok_or_else(|| missing("message", "body"))?;
        let body = body_bytes(engine, body)?;

        msg_id.serialize(out);
        seqno.serialize(out);
        (body.len() as i32).serialize(out);
        out.extend_from_slice(&body);
        Ok(())
    }

    fn load(&self, _: &Engine<'_>, buf: &mut Cursor<'_>) -> deserialize::Result<Object> {
        let msg_id = i64::deserialize(buf)?;
        let seqno = i32::deserialize(buf)?;
        let len = i32::deserialize(buf)?;
        if len < 0 || len % 4 != 0 {
            return Err(Error::InvalidLength { len });
        }
        let body = buf.read_slice(len as usize)?;
        Ok(Object::new("message")
            .with("msg_id", msg_id)
            .with("seqno", seqno)
            .with("bytes", len)
            .with("body", Value::Raw(body.to_vec())))
    }
}

struct RpcResultCodec;

impl CustomCodec for RpcResultCodec {
    fn dump(&self, engine: &Engine<'_>, object: &Object, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let req_msg_id = object.long("req_msg_id").ok_or_else(|| missing("rpc_result", "req_msg_id"))?;
        let result = object.get("result").ok_or_else(|| missing("rpc_result", "result"))?;
        req_msg_id.serialize(out);
        out.extend(body_bytes(engine, result)?);
        Ok(())
    }

    fn load(&self, _: &Engine<'_>, buf: &mut Cursor<'_>) -> deserialize::Result<Object> {
        let req_msg_id = i64::deserialize(buf)?;
        let mut result = Vec::new();
        buf.read_to_end(&mut result);
        Ok(Object::new("rpc_result").with("req_msg_id", req_msg_id).with("result", Value::Raw(result)))
    }
}

// ─── Builders ────────────────────────────────────────────────────────────────

/// One entry of a `msg_container`.
pub fn message(msg_id: i64, seqno: i32, body: Value) -> Object {
    Object::new("message").with("msg_id", msg_id).with("seqno", seqno).with("body", body)
}

/// The bare encoding of a `message` whose body is already serialized.
pub fn message_entry(msg_id: i64, seqno: i32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + body.len());
    msg_id.serialize(&mut out);
    seqno.serialize(&mut out);
    (body.len() as i32).serialize(&mut out);
    out.extend_from_slice(body);
    out
}

pub fn msg_container(messages: impl IntoIterator<Item = Object>) -> Object {
    Object::new("msg_container").with("messages", Value::vector(messages))
}

pub fn msgs_ack(msg_ids: impl IntoIterator<Item = i64>) -> Object {
    Object::new("msgs_ack").with("msg_ids", Value::vector(msg_ids))
}

/// `result` may be [`Value::Raw`] bytes already encoded by a user schema.
pub fn rpc_result(req_msg_id: i64, result: Value) -> Object {
    Object::new("rpc_result").with("req_msg_id", req_msg_id).with("result", result)
}

pub fn rpc_error(code: i32, message: &str) -> Object {
    Object::new("rpc_error").with("error_code", code).with("error_message", message)
}

pub fn pong(msg_id: i64, ping_id: i64) -> Object {
    Object::new("pong").with("msg_id", msg_id).with("ping_id", ping_id)
}

pub fn bad_msg_notification(bad_msg_id: i64, bad_msg_seqno: i32, error_code: i32) -> Object {
    Object::new("bad_msg_notification")
        .with("bad_msg_id", bad_msg_id)
        .with("bad_msg_seqno", bad_msg_seqno)
        .with("error_code", error_code)
}

/// Error code 48, carrying the salt the client should retry with.
pub fn bad_server_salt(bad_msg_id: i64, bad_msg_seqno: i32, new_server_salt: i64) -> Object {
    Object::new("bad_server_salt")
        .with("bad_msg_id", bad_msg_id)
        .with("bad_msg_seqno", bad_msg_seqno)
        .with("error_code", 48)
        .with("new_server_salt", new_server_salt)
}

pub fn new_session_created(first_msg_id: i64, unique_id: i64, server_salt: i64) -> Object {
    Object::new("new_session_created")
        .with("first_msg_id", first_msg_id)
        .with("unique_id", unique_id)
        .with("server_salt", server_salt)
}
