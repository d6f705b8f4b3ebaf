//! Encrypted and unencrypted senders.
//!
//! Every content-related message sent on an encrypted session is kept in
//! the ack store until the client acknowledges it. While anything is
//! pending, the next message goes out in a `msg_container` together with
//! the pending entries.

use std::sync::Arc;

use pylon_crypto::Side;
use pylon_mtproto::{EncryptedMessage, PlainMessage, service};
use pylon_tl::{Object, Value};

use crate::connection::Connection;
use crate::context::RequestContext;
use crate::errors::{Result, ServerError};

/// Encodes `body` on a blocking thread.
async fn dump(ctx: &RequestContext, body: &Value) -> Result<Vec<u8>> {
    let server = Arc::clone(ctx.server());
    let body = body.clone();
    Ok(tokio::task::spawn_blocking(move || server.schemas.dump(&body)).await??)
}

/// Sends `body` on the request's session and returns its message id.
///
/// `response` selects the id tag: `+1` for answers, `+3` for
/// server-originated messages.
pub async fn send_encrypted(ctx: &RequestContext, body: &Value, response: bool) -> Result<i64> {
    let auth_key = ctx.auth_key.clone().ok_or(ServerError::NoAuthKey)?;
    let key_id = auth_key.id();
    let server = ctx.server();
    let conn = &ctx.connection;

    let bytes = dump(ctx, body).await?;
    let content_related = body.name().is_none_or(service::is_content_related);
    let msg_id = server.msg_ids.next(response);
    let seq_no = conn.next_seq_no(ctx.session_id, content_related);

    let mut outer = (msg_id, seq_no, bytes);
    if content_related {
        let acks = &server.stores.acks;
        let pending = acks.get_list(key_id, ctx.session_id).await?;
        let entry = service::message_entry(msg_id, seq_no, &outer.2);
        acks.set(key_id, ctx.session_id, msg_id, entry.clone()).await?;

        if !pending.is_empty() {
            tracing::debug!("[send] bundling {} pending message(s) with {msg_id}", pending.len());
            let mut entries: Vec<Value> = pending.into_iter().map(|(_, e)| Value::Raw(e)).collect();
            entries.push(Value::Raw(entry));
            let container = Object::new("msg_container").with("messages", Value::Vector(entries));
            let container_bytes = dump(ctx, &container.into()).await?;
            outer = (server.msg_ids.next(response), conn.next_seq_no(ctx.session_id, false), container_bytes);
        }
    }

    let (outer_id, outer_seq, body) = outer;
    let message = EncryptedMessage { salt: ctx.salt, session_id: ctx.session_id, msg_id: outer_id, seq_no: outer_seq, body };
    let frame = tokio::task::spawn_blocking(move || message.encrypt(&auth_key, Side::Server)).await?;
    conn.push(frame)?;
    Ok(msg_id)
}

/// Sends `body` as an unencrypted message and returns its message id.
pub async fn send_plain(conn: &Arc<Connection>, body: &Object) -> Result<i64> {
    let server = Arc::clone(conn.server());
    let body: Value = body.clone().into();
    let bytes = tokio::task::spawn_blocking(move || server.schemas.dump(&body)).await??;
    let msg_id = conn.server().msg_ids.next(true);
    conn.push(PlainMessage::new(msg_id, bytes).to_bytes())?;
    Ok(msg_id)
}
