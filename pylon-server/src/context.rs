//! Shared server state and the per-request context threaded through dispatch.

use std::fmt;
use std::sync::Arc;

use pylon_crypto::AuthKey;
use pylon_mtproto::{MessageIdGenerator, MsgIdWindow, Stores, service};
use pylon_tl::{Object, Schema, SchemaSet};

use crate::connection::Connection;
use crate::errors::ServerError;
use crate::middleware::{self, Middleware};
use crate::registry::RpcRegistry;
use crate::sender;

/// Everything connections share: stores, schemas, handlers, middleware
/// and the message id generator.
pub struct ServerState {
    pub stores: Stores,
    /// Service schema first, then the user schema.
    pub schemas: SchemaSet,
    pub registry: RpcRegistry,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub msg_ids: MessageIdGenerator,
    pub window: MsgIdWindow,
}

impl ServerState {
    /// State with the default middleware chain and message id window.
    pub fn new(stores: Stores, user_schema: Option<Arc<Schema>>, registry: RpcRegistry) -> Result<Self, ServerError> {
        let schemas = service::schema_set(user_schema.clone())?;
        if let Some(schema) = &user_schema {
            for name in registry.names() {
                if schema.function_by_name(name).is_none() {
                    tracing::warn!("[pylon] handler `{name}` has no function in the user schema");
                }
            }
        }
        Ok(Self {
            stores,
            schemas,
            registry,
            middleware: middleware::default_chain(),
            msg_ids: MessageIdGenerator::new(),
            window: MsgIdWindow::default(),
        })
    }

    pub fn with_window(mut self, window: MsgIdWindow) -> Self {
        self.window = window;
        self
    }

    /// Appends `m` as the innermost middleware.
    pub fn with_middleware(mut self, m: Arc<dyn Middleware>) -> Self {
        self.middleware.push(m);
        self
    }

    /// Replaces the whole chain.
    pub fn with_chain(mut self, chain: Vec<Arc<dyn Middleware>>) -> Self {
        self.middleware = chain;
        self
    }
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState")
            .field("stores", &self.stores)
            .field("registry", &self.registry)
            .field("middleware", &self.middleware.len())
            .field("window", &self.window)
            .finish()
    }
}

/// One message being handled.
///
/// Cloned for every container entry and background task, so concurrent
/// requests never see each other's fields.
#[derive(Clone)]
pub struct RequestContext {
    pub connection: Arc<Connection>,
    /// `None` for unencrypted handshake messages.
    pub auth_key: Option<AuthKey>,
    pub session_id: i64,
    pub salt: i64,
    pub msg_id: i64,
    pub seq_no: i32,
}

impl RequestContext {
    /// Context of an unencrypted message.
    pub fn plain(connection: Arc<Connection>, msg_id: i64) -> Self {
        Self { connection, auth_key: None, session_id: 0, salt: 0, msg_id, seq_no: 0 }
    }

    pub fn server(&self) -> &Arc<ServerState> {
        self.connection.server()
    }

    pub fn stores(&self) -> &Stores {
        &self.connection.server().stores
    }

    pub fn key_id(&self) -> Option<u64> {
        self.auth_key.as_ref().map(AuthKey::id)
    }

    /// Sends a server-originated message on this request's session.
    pub async fn notify(&self, body: &Object) -> Result<i64, ServerError> {
        sender::send_encrypted(self, &body.clone().into(), false).await
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("auth_key", &self.auth_key)
            .field("session_id", &self.session_id)
            .field("msg_id", &self.msg_id)
            .field("seq_no", &self.seq_no)
            .finish_non_exhaustive()
    }
}
