//! MTProto server built on `pylon-mtproto`.
//!
//! A [`Server`] accepts transport connections and feeds each frame to the
//! dispatcher. Unencrypted handshake calls run inline; everything on an
//! encrypted session passes the [middleware](middleware) chain and is
//! answered by the service endpoint or a user [`Handler`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pylon_server::{HandlerError, RpcRegistry, Server, ServerConfig, handler_fn, keys};
//! use pylon_tl::{Object, Schema, Value};
//!
//! # async fn f() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = Schema::from_tl("echoed text:string = Echoed;\n---functions---\necho text:string = Echoed;")?;
//! let registry = RpcRegistry::new().with(
//!     "echo",
//!     handler_fn(|_ctx, call| async move {
//!         let echoed = Object::new("echoed").with("text", call.str("text").unwrap_or_default());
//!         Ok::<Value, HandlerError>(echoed.into())
//!     }),
//! );
//!
//! let config = ServerConfig::default();
//! let keys = keys::ensure_key(config.rsa_key_ring()?)?;
//! let server = Server::from_config(&config, keys, Some(Arc::new(schema)), registry)?;
//! let listener = tokio::net::TcpListener::bind(config.listen[0]).await?;
//! server.run(vec![listener]).await?;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod keys;
pub mod middleware;
pub mod registry;
pub mod sender;
pub mod server;
pub mod services;

pub use config::{ConfigError, ServerConfig};
pub use context::{RequestContext, ServerState};
pub use errors::{HandlerError, RpcError, ServerError};
pub use middleware::{Endpoint, Middleware, Next, Reply};
pub use registry::{Handler, RpcRegistry, handler_fn};
pub use server::Server;
