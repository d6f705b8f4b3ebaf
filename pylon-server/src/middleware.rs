//! Middleware around every dispatched request.
//!
//! A chain is an ordered list of [`Middleware`] ending in an [`Endpoint`].
//! The first-listed middleware is outermost: it sees the request first and
//! the reply last. Each one decides whether to call [`Next::run`] or to
//! answer on its own.

use std::sync::Arc;

use async_trait::async_trait;
use pylon_mtproto::service;
use pylon_mtproto::store::SessionStore;
use pylon_tl::{Object, Value};

use crate::context::RequestContext;
use crate::errors::HandlerError;

/// What a request produced.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Wrapped in `rpc_result` for the request's message id.
    Result(Value),
    /// Sent as a message of its own, e.g. `pong` or `bad_server_salt`.
    Message(Object),
    /// Sent outside encryption.
    Unencrypted(Object),
    /// No answer.
    Nothing,
}

/// The innermost handler of a chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn invoke(&self, ctx: &mut RequestContext, request: &Value) -> Result<Reply, HandlerError>;
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext, request: &Value, next: Next<'_>) -> Result<Reply, HandlerError>;
}

/// The remainder of a chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self { chain, endpoint }
    }

    pub async fn run(self, ctx: &mut RequestContext, request: &Value) -> Result<Reply, HandlerError> {
        match self.chain.split_first() {
            Some((first, rest)) => first.handle(ctx, request, Next { chain: rest, endpoint: self.endpoint }).await,
            None => self.endpoint.invoke(ctx, request).await,
        }
    }
}

/// An endpoint that answers nothing. Lets a container pass the chain once.
pub struct Noop;

#[async_trait]
impl Endpoint for Noop {
    async fn invoke(&self, _: &mut RequestContext, _: &Value) -> Result<Reply, HandlerError> {
        Ok(Reply::Nothing)
    }
}

// ─── Built-ins ────────────────────────────────────────────────────────────────

/// Registers unseen sessions and announces them with `new_session_created`.
pub struct SessionMiddleware;

#[async_trait]
impl Middleware for SessionMiddleware {
    async fn handle(&self, ctx: &mut RequestContext, request: &Value, next: Next<'_>) -> Result<Reply, HandlerError> {
        let Some(key_id) = ctx.key_id() else {
            return next.run(ctx, request).await;
        };

        let stores = ctx.stores();
        if stores.sessions.create(key_id, ctx.session_id).await? {
            stores.acks.create_session_store(key_id, ctx.session_id).await?;
            let salt = current_salt(ctx, key_id).await?;
            let unique_id = i64::from_le_bytes(pylon_crypto::random_array());
            tracing::debug!("[session] new session {} on key {key_id:016x}", ctx.session_id);
            ctx.notify(&service::new_session_created(ctx.msg_id, unique_id, salt))
                .await
                .map_err(HandlerError::internal)?;
        }
        next.run(ctx, request).await
    }
}

/// Refuses messages whose salt is not valid right now.
pub struct SaltMiddleware;

#[async_trait]
impl Middleware for SaltMiddleware {
    async fn handle(&self, ctx: &mut RequestContext, request: &Value, next: Next<'_>) -> Result<Reply, HandlerError> {
        let Some(key_id) = ctx.key_id() else {
            return next.run(ctx, request).await;
        };

        if ctx.stores().salts.has_salt(key_id, ctx.salt).await? {
            return next.run(ctx, request).await;
        }
        let salt = current_salt(ctx, key_id).await?;
        tracing::debug!("[salt] msg {} used a stale salt", ctx.msg_id);
        Ok(Reply::Message(service::bad_server_salt(ctx.msg_id, ctx.seq_no, salt)))
    }
}

async fn current_salt(ctx: &RequestContext, key_id: u64) -> Result<i64, HandlerError> {
    let salts = ctx.stores().salts.get_future_salts(key_id, 1).await?;
    salts
        .first()
        .map(|s| s.salt)
        .ok_or_else(|| HandlerError::internal("salt store returned no salts"))
}

/// The chain every encrypted request passes through unless configured otherwise.
pub fn default_chain() -> Vec<Arc<dyn Middleware>> {
    vec![Arc::new(SessionMiddleware), Arc::new(SaltMiddleware)]
}
