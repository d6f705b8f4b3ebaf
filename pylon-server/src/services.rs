//! Service functions the server answers itself.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use pylon_mtproto::service;
use pylon_mtproto::store::{MAX_FUTURE_SALTS, SessionStore, StoreError};
use pylon_tl::{Call, Object, Value};

use crate::context::RequestContext;
use crate::errors::{HandlerError, RpcError};
use crate::middleware::{Endpoint, Reply};

/// Endpoint for the functions of the service schema.
pub struct ServiceEndpoint;

#[async_trait]
impl Endpoint for ServiceEndpoint {
    async fn invoke(&self, ctx: &mut RequestContext, request: &Value) -> Result<Reply, HandlerError> {
        let Some(call) = request.as_call() else {
            return Ok(Reply::Nothing);
        };
        let Some(key_id) = ctx.key_id() else {
            return Err(RpcError::new(401, "AUTH_KEY_UNREGISTERED").into());
        };

        match call.name.as_str() {
            "ping" => Ok(Reply::Message(service::pong(ctx.msg_id, long(call, "ping_id")?))),
            "ping_delay_disconnect" => {
                let delay = call.int("disconnect_delay").ok_or_else(|| missing("disconnect_delay"))?;
                ctx.connection.delay_disconnect(Duration::from_secs(delay.max(0) as u64));
                Ok(Reply::Message(service::pong(ctx.msg_id, long(call, "ping_id")?)))
            }
            "get_future_salts" => get_future_salts(ctx, key_id, call).await,
            "destroy_session" => destroy_session(ctx, key_id, call).await,
            "destroy_auth_key" => Ok(Reply::Unencrypted(destroy_auth_key(ctx, key_id).await)),
            "rpc_drop_answer" => {
                let req_msg_id = long(call, "req_msg_id")?;
                let answer = if ctx.connection.drop_rpc(req_msg_id) {
                    Object::new("rpc_answer_dropped_running")
                } else {
                    Object::new("rpc_answer_unknown")
                };
                Ok(Reply::Result(answer.into()))
            }
            _ => Err(RpcError::method_invalid().into()),
        }
    }
}

fn missing(field: &str) -> HandlerError {
    RpcError::bad_request(format!("{}_INVALID", field.to_ascii_uppercase())).into()
}

fn long(call: &Call, field: &str) -> Result<i64, HandlerError> {
    call.long(field).ok_or_else(|| missing(field))
}

fn unix_now() -> i32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i32).unwrap_or_default()
}

async fn get_future_salts(ctx: &RequestContext, key_id: u64, call: &Call) -> Result<Reply, HandlerError> {
    let num = call.int("num").unwrap_or(1).clamp(1, MAX_FUTURE_SALTS);
    let salts = ctx.stores().salts.get_future_salts(key_id, num).await?;
    let salts = salts.into_iter().map(|s| {
        Object::new("future_salt")
            .with("valid_since", s.valid_since)
            .with("valid_until", s.valid_until)
            .with("salt", s.salt)
    });
    Ok(Reply::Message(
        Object::new("future_salts")
            .with("req_msg_id", ctx.msg_id)
            .with("now", unix_now())
            .with("salts", Value::vector(salts)),
    ))
}

async fn destroy_session(ctx: &RequestContext, key_id: u64, call: &Call) -> Result<Reply, HandlerError> {
    let session_id = long(call, "session_id")?;
    let stores = ctx.stores();
    let existed = stores.sessions.destroy(key_id, session_id).await?;
    if existed {
        stores.acks.drop_session_store(key_id, session_id).await?;
    }
    let name = if existed { "destroy_session_ok" } else { "destroy_session_none" };
    Ok(Reply::Message(Object::new(name).with("session_id", session_id)))
}

async fn destroy_auth_key(ctx: &RequestContext, key_id: u64) -> Object {
    let stores = ctx.stores();
    match stores.auth_keys.delete(key_id).await {
        Ok(()) => {
            if let Err(e) = stores.salts.clear(Some(key_id)).await {
                tracing::warn!("[service] could not clear salts of {key_id:016x}: {e}");
            }
            tracing::info!("[service] auth key {key_id:016x} destroyed");
            Object::new("destroy_auth_key_ok")
        }
        Err(StoreError::NotFound) => Object::new("destroy_auth_key_none"),
        Err(e) => {
            tracing::warn!("[service] destroying {key_id:016x} failed: {e}");
            Object::new("destroy_auth_key_fail")
        }
    }
}
