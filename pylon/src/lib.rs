//! # pylon: MTProto 2.0 server toolkit
//!
//! `pylon` bundles the workspace crates behind one dependency:
//!
//! | Sub-crate         | Role                                                   |
//! |-------------------|--------------------------------------------------------|
//! | `pylon-tl-parser` | Parse `.tl` schema text into definitions               |
//! | `pylon-tl`        | Binary codec and the runtime schema engine             |
//! | `pylon-crypto`    | AES-IGE/CTR, SHA, RSA, auth keys, primes               |
//! | `pylon-mtproto`   | Envelopes, handshake, transports, stores               |
//! | `pylon-server`    | Dispatch pipeline, middleware, connection loop, config |
//!
//! ## Quick start: a server with one function
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pylon::server::{HandlerError, RpcRegistry, Server, ServerConfig, handler_fn, keys};
//! use pylon::tl::{Object, Schema, Value};
//! use pylon::mtproto::store::RsaKeyRing;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = Arc::new(Schema::from_tl("
//!     greeting text:string = Greeting;
//!     ---functions---
//!     hello name:string = Greeting;
//! ")?);
//!
//! let registry = RpcRegistry::new().with("hello", handler_fn(|_ctx, call| async move {
//!     let name = call.str("name").unwrap_or("stranger");
//!     Ok::<Value, HandlerError>(Object::new("greeting").with("text", format!("hello, {name}")).into())
//! }));
//!
//! let config = ServerConfig::default();
//! let rsa_keys = keys::ensure_key(RsaKeyRing::default())?;
//! let server = Server::from_config(&config, rsa_keys, Some(schema), registry)?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8443").await?;
//! server.run(vec![listener]).await?;
//! # Ok(()) }
//! ```
//!
//! ## Schemas at runtime
//!
//! Nothing is generated at build time. A [`tl::Schema`] is built from TL
//! text (or from combinators directly) and values travel as
//! [`tl::Value`]s, so a schema can be swapped without recompiling.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`pylon_tl`]: codec primitives, values and the schema engine.
pub use pylon_tl as tl;

/// Re-export of [`pylon_crypto`]: AES-IGE/CTR, SHA, RSA, `AuthKey`.
pub use pylon_crypto as crypto;

/// Re-export of [`pylon_mtproto`]: envelopes, handshake, transports and stores.
pub use pylon_mtproto as mtproto;

/// Re-export of [`pylon_server`] (requires `feature = "server"`).
#[cfg(feature = "server")]
pub use pylon_server as server;

/// Re-export of [`pylon_tl_parser`] (requires `feature = "parser"`).
#[cfg(feature = "parser")]
pub use pylon_tl_parser as parser;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use pylon_crypto::AuthKey;
pub use pylon_mtproto::client::{self, ClientSession, Finished, Outcome};
pub use pylon_mtproto::{EncryptedMessage, Handshake, PlainMessage, Stores};
pub use pylon_tl::{Call, Object, Schema, SchemaSet, Value};

#[cfg(feature = "server")]
pub use pylon_server::{RpcRegistry, Server, ServerConfig, handler_fn};
