//! Routing of decoded messages.
//!
//! [`classify`] picks a [`Strategy`] from the message alone. The strategies:
//!
//! * `Handshake`: runs inline, in arrival order, and answers unencrypted.
//! * `Container`: passes the middleware chain once, then every entry is
//!   dispatched as its own task.
//! * `Ack`: pending entries are deleted in the background.
//! * `Service` and `UserRpc`: run in their own task behind the middleware
//!   chain and answer through the encrypted sender.
//! * `Unknown`: logged and dropped.
//!
//! [`handle_frame`] is the only place that decides between answering,
//! dropping and closing the connection.

use std::future::Future;
use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::{GzDecoder, ZlibDecoder};
use pylon_crypto::Side;
use pylon_mtproto::store::StoreError;
use pylon_mtproto::transport::AUTH_KEY_NOT_FOUND;
use pylon_mtproto::{EncryptedMessage, PlainMessage, envelope, service};
use pylon_tl::{Call, FieldType, Lookup, Value};

use crate::connection::Connection;
use crate::context::RequestContext;
use crate::errors::{HandlerError, Result, RpcError, ServerError};
use crate::middleware::{Endpoint, Next, Noop, Reply};
use crate::sender;
use crate::services::ServiceEndpoint;

/// Guards against inflating a hostile `gzip_packed` without bound.
const MAX_INFLATED_LEN: u64 = 16 * 1024 * 1024;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Handshake,
    Container,
    Ack,
    Service,
    UserRpc,
    Unknown,
}

/// What became of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; any answer goes through the senders.
    Respond,
    /// Ignored without an answer.
    Drop,
    /// The connection must be closed.
    Close,
}

/// Picks the strategy for a decoded message.
pub fn classify(encrypted: bool, message: &Value) -> Strategy {
    let handshake = |c: &Call| service::HANDSHAKE_FUNCTIONS.contains(&c.name.as_str());
    match message {
        Value::Call(call) if !encrypted && handshake(call) => Strategy::Handshake,
        _ if !encrypted => Strategy::Unknown,
        Value::Object(o) if o.name == "msg_container" => Strategy::Container,
        Value::Object(o) if o.name == "msgs_ack" => Strategy::Ack,
        Value::Call(call) if handshake(call) => Strategy::Unknown,
        Value::Call(call) if service::is_service_function(&call.name) => Strategy::Service,
        Value::Call(_) => Strategy::UserRpc,
        _ => Strategy::Unknown,
    }
}

/// Handles one transport frame.
pub async fn handle_frame(conn: &Arc<Connection>, frame: Vec<u8>) -> Disposition {
    let outcome = if envelope::is_plain(&frame) {
        handle_plain(conn, &frame).await
    } else {
        handle_encrypted(conn, frame).await
    };
    match outcome {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("[dispatch] closing connection: {e}");
            Disposition::Close
        }
    }
}

async fn handle_plain(conn: &Arc<Connection>, frame: &[u8]) -> Result<Disposition> {
    let message = PlainMessage::from_bytes(frame)?;
    let (value, _) = conn.server().schemas.load(&message.body)?;
    if classify(false, &value) != Strategy::Handshake {
        tracing::debug!("[dispatch] dropping unencrypted {}", value.name().unwrap_or("value"));
        return Ok(Disposition::Drop);
    }

    let mut ctx = RequestContext::plain(Arc::clone(conn), message.msg_id);
    let server = Arc::clone(conn.server());
    let outcome = Next::new(&server.middleware, &HandshakeEndpoint).run(&mut ctx, &value).await;
    match outcome {
        Ok(reply) => {
            deliver(&ctx, Ok(reply)).await?;
            Ok(Disposition::Respond)
        }
        Err(e) => {
            tracing::warn!("[dispatch] handshake failed: {e}");
            Ok(Disposition::Close)
        }
    }
}

async fn handle_encrypted(conn: &Arc<Connection>, frame: Vec<u8>) -> Result<Disposition> {
    let key_id = envelope::auth_key_id(&frame)?;
    if let Some(bound) = conn.bound_key() {
        if bound != key_id {
            return Err(ServerError::AuthKeyMismatch { bound, got: key_id });
        }
    }

    let auth_key = match conn.server().stores.auth_keys.get(key_id).await {
        Ok(key) => key,
        Err(StoreError::NotFound) => {
            tracing::info!("[dispatch] {}", ServerError::UnknownAuthKey { id: key_id });
            conn.push_transport_error(AUTH_KEY_NOT_FOUND)?;
            return Ok(Disposition::Close);
        }
        Err(e) => return Err(e.into()),
    };

    let key = auth_key.clone();
    let message = tokio::task::spawn_blocking(move || EncryptedMessage::decrypt(&frame, &key, Side::Client)).await??;
    conn.bind_key(key_id)?;

    let ctx = RequestContext {
        connection: Arc::clone(conn),
        auth_key: Some(auth_key),
        session_id: message.session_id,
        salt: message.salt,
        msg_id: message.msg_id,
        seq_no: message.seq_no,
    };
    process(ctx, message.body).await
}

/// Validates, decodes and routes one message body. Boxed so container
/// entries can re-enter it from their own tasks.
fn process(ctx: RequestContext, body: Vec<u8>) -> BoxFuture<Result<Disposition>> {
    Box::pin(async move {
        if let Err(code) = ctx.server().window.check(ctx.msg_id) {
            tracing::debug!("[dispatch] msg {} rejected: {code:?}", ctx.msg_id);
            let notice = service::bad_msg_notification(ctx.msg_id, ctx.seq_no, code.code());
            sender::send_encrypted(&ctx, &notice.into(), true).await?;
            return Ok(Disposition::Respond);
        }

        let value = match decode(&ctx, body).await {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("[dispatch] msg {} could not be decoded: {e}", ctx.msg_id);
                deliver(&ctx, Err(RpcError::input_fetch_fail().into())).await?;
                return Ok(Disposition::Respond);
            }
        };
        route(ctx, value).await
    })
}

/// Decodes a body on a blocking thread, unwrapping `gzip_packed`.
async fn decode(ctx: &RequestContext, body: Vec<u8>) -> Result<Value> {
    let server = Arc::clone(ctx.server());
    tokio::task::spawn_blocking(move || -> Result<Value> {
        let (mut value, _) = server.schemas.load(&body)?;
        while let Some(packed) = gzip_packed(&value) {
            let inflated = inflate(packed)?;
            value = server.schemas.load(&inflated)?.0;
        }
        Ok(value)
    })
    .await?
}

fn gzip_packed(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Object(o) if o.name == "gzip_packed" => o.bytes("packed_data"),
        _ => None,
    }
}

/// Inflates gzip data, falling back to a bare zlib stream.
fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if GzDecoder::new(data).take(MAX_INFLATED_LEN).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }
    out.clear();
    ZlibDecoder::new(data).take(MAX_INFLATED_LEN).read_to_end(&mut out)?;
    Ok(out)
}

async fn route(mut ctx: RequestContext, value: Value) -> Result<Disposition> {
    match classify(true, &value) {
        Strategy::Container => {
            let server = Arc::clone(ctx.server());
            let reply = Next::new(&server.middleware, &Noop).run(&mut ctx, &value).await;
            if reply != Ok(Reply::Nothing) {
                deliver(&ctx, reply).await?;
                return Ok(Disposition::Respond);
            }
            for entry in value.as_object().and_then(|o| o.vector("messages")).unwrap_or_default() {
                let Some(entry) = entry.as_object() else { continue };
                let (Some(msg_id), Some(seq_no), Some(body)) =
                    (entry.long("msg_id"), entry.int("seqno"), entry.bytes("body"))
                else {
                    continue;
                };
                let sub = RequestContext { msg_id, seq_no, ..ctx.clone() };
                let body = body.to_vec();
                tokio::spawn(async move {
                    let conn = Arc::clone(&sub.connection);
                    match process(sub, body).await {
                        Ok(Disposition::Close) => conn.close(),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("[dispatch] container entry failed: {e}");
                            conn.close();
                        }
                    }
                });
            }
            Ok(Disposition::Respond)
        }
        Strategy::Ack => {
            let ids: Vec<i64> = value
                .as_object()
                .and_then(|o| o.vector("msg_ids"))
                .unwrap_or_default()
                .iter()
                .filter_map(Value::as_long)
                .collect();
            let Some(key_id) = ctx.key_id() else {
                return Ok(Disposition::Drop);
            };
            for msg_id in ids {
                let acks = Arc::clone(&ctx.stores().acks);
                let session_id = ctx.session_id;
                tokio::spawn(async move {
                    if let Err(e) = acks.delete(key_id, session_id, msg_id).await {
                        tracing::warn!("[dispatch] ack of {msg_id} failed: {e}");
                    }
                });
            }
            Ok(Disposition::Respond)
        }
        Strategy::Service => {
            spawn_rpc(ctx, value, ServiceEndpoint);
            Ok(Disposition::Respond)
        }
        Strategy::UserRpc => {
            spawn_rpc(ctx, value, UserEndpoint);
            Ok(Disposition::Respond)
        }
        Strategy::Handshake | Strategy::Unknown => {
            tracing::debug!("[dispatch] ignoring {} in msg {}", value.name().unwrap_or(value.kind()), ctx.msg_id);
            Ok(Disposition::Drop)
        }
    }
}

/// Runs an RPC in its own task. The task can be cancelled by
/// `rpc_drop_answer` until it answers.
fn spawn_rpc<E: Endpoint + 'static>(mut ctx: RequestContext, request: Value, endpoint: E) {
    let conn = Arc::clone(&ctx.connection);
    let msg_id = ctx.msg_id;
    let task = tokio::spawn(async move {
        let server = Arc::clone(ctx.server());
        let reply = Next::new(&server.middleware, &endpoint).run(&mut ctx, &request).await;
        ctx.connection.finish_rpc(ctx.msg_id);
        if let Err(e) = deliver(&ctx, reply).await {
            tracing::warn!("[dispatch] answering msg {} failed: {e}", ctx.msg_id);
            ctx.connection.close();
        }
    });
    conn.track_rpc(msg_id, task.abort_handle());
}

/// Sends whatever a chain produced.
async fn deliver(ctx: &RequestContext, reply: std::result::Result<Reply, HandlerError>) -> Result<()> {
    match reply {
        Ok(Reply::Result(value)) => {
            sender::send_encrypted(ctx, &service::rpc_result(ctx.msg_id, value).into(), true).await?;
        }
        Ok(Reply::Message(object)) => {
            sender::send_encrypted(ctx, &object.into(), true).await?;
        }
        Ok(Reply::Unencrypted(object)) => {
            sender::send_plain(&ctx.connection, &object).await?;
        }
        Ok(Reply::Nothing) => {}
        Err(e) => {
            let (code, message) = e.to_wire();
            let error = service::rpc_error(code, &message);
            sender::send_encrypted(ctx, &service::rpc_result(ctx.msg_id, error.into()).into(), true).await?;
        }
    }
    Ok(())
}

// ─── Endpoints ────────────────────────────────────────────────────────────────

/// Feeds the connection's handshake state machine.
struct HandshakeEndpoint;

#[async_trait]
impl Endpoint for HandshakeEndpoint {
    async fn invoke(&self, ctx: &mut RequestContext, request: &Value) -> std::result::Result<Reply, HandlerError> {
        let Some(call) = request.as_call() else {
            return Ok(Reply::Nothing);
        };
        let mut handshake = ctx.connection.handshake().lock().await;
        let answer = handshake.handle(call, ctx.stores()).await.map_err(HandlerError::internal)?;
        Ok(Reply::Unencrypted(answer))
    }
}

/// Looks the call up in the registry and runs the handler in a task of
/// its own so a panic becomes an `rpc_error`.
struct UserEndpoint;

#[async_trait]
impl Endpoint for UserEndpoint {
    async fn invoke(&self, ctx: &mut RequestContext, request: &Value) -> std::result::Result<Reply, HandlerError> {
        let Some(call) = request.as_call() else {
            return Ok(Reply::Nothing);
        };
        let Some(handler) = ctx.server().registry.get(&call.name) else {
            tracing::debug!("[dispatch] no handler for {}", call.name);
            return Err(RpcError::method_invalid().into());
        };

        let returns = ctx.server().schemas.function_by_name(&call.name).map(|f| f.returns.clone());
        let handler_ctx = ctx.clone();
        let call = call.clone();
        match tokio::spawn(async move { handler.call(&handler_ctx, call).await }).await {
            Ok(Ok(value)) => match returns {
                Some(returns) => encode_result(ctx, returns, value).await.map(Reply::Result),
                None => Ok(Reply::Result(value)),
            },
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let cause = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".into());
                tracing::error!("[dispatch] handler panicked: {cause}");
                Err(HandlerError::Internal(cause))
            }
            Err(e) => Err(HandlerError::internal(e)),
        }
    }
}


/// Encodes a handler's value as the function's declared return type.
/// A value that does not fit is reported as `rpc_error` 500.
async fn encode_result(ctx: &RequestContext, returns: FieldType, value: Value) -> std::result::Result<Value, HandlerError> {
    let server = Arc::clone(ctx.server());
    let encoded = tokio::task::spawn_blocking(move || server.schemas.dump_typed(&returns, &value))
        .await
        .map_err(HandlerError::internal)?;
    match encoded {
        Ok(bytes) => Ok(Value::Raw(bytes)),
        Err(e) => {
            tracing::warn!("[dispatch] result of msg {} does not match its return type: {e}", ctx.msg_id);
            Err(RpcError::result_type_invalid().into())
        }
    }
}
