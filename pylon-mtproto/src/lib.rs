//! MTProto 2.0 server protocol.
//!
//! This crate handles:
//! * The service schema (`msg_container`, `rpc_result`, salts, handshake types)
//! * Message ids, envelopes, and `bad_msg_notification` codes
//! * The server side of the DH auth key exchange, and a client driver for it
//! * Transport framing and obfuscation over any tokio stream
//! * Contracts for the shared stores, with in-memory implementations
//!
//! Dispatching decrypted messages to handlers lives one layer up.

#![deny(unsafe_code)]

pub mod client;
pub mod envelope;
pub mod handshake;
pub mod message_id;
pub mod service;
pub mod store;
pub mod transport;

pub use envelope::{EncryptedMessage, PlainMessage};
pub use handshake::{Handshake, Stage};
pub use message_id::{BadMsgCode, MessageIdGenerator, MsgIdWindow};
pub use store::Stores;
