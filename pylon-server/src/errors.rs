//! Error types for pylon-server.

use std::{fmt, io};

use pylon_crypto::rsa;
use pylon_mtproto::{envelope, handshake, store::StoreError, transport};
use pylon_tl::{EncodeError, SchemaError, deserialize};

use crate::config::ConfigError;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// A business error a handler returns to the client as `rpc_error`.
///
/// # Example
/// `RpcError::with_value(420, "FLOOD_WAIT", 30)` is sent as
/// `rpc_error{error_code: 420, error_message: "FLOOD_WAIT_30"}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE, including any numeric suffix.
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// `name_value`, e.g. `FLOOD_WAIT_30`.
    pub fn with_value(code: i32, name: &str, value: u32) -> Self {
        Self { code, message: format!("{name}_{value}") }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// The method is not registered.
    pub fn method_invalid() -> Self {
        Self::bad_request("METHOD_INVALID")
    }

    /// The body of an encrypted message could not be decoded.
    pub fn input_fetch_fail() -> Self {
        Self::bad_request("INPUT_FETCH_FAIL")
    }

    /// A handler returned a value its function's return type cannot hold.
    pub fn result_type_invalid() -> Self {
        Self::new(500, "RESULT_TYPE_INVALID")
    }

    /// Match on the message, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT_30")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.message.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.message.ends_with(suffix)
        } else {
            self.message == pattern
        }
    }
}

// ─── HandlerError ─────────────────────────────────────────────────────────────

/// What a user handler may fail with.
#[derive(Clone, Debug, PartialEq)]
pub enum HandlerError {
    /// Delivered to the client as the given `rpc_error`.
    Rpc(RpcError),
    /// Any other failure. Delivered as `rpc_error` code 0 with this text.
    Internal(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)      => write!(f, "{e}"),
            Self::Internal(s) => write!(f, "internal error: {s}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<RpcError> for HandlerError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self { Self::Internal(e.to_string()) }
}

impl From<EncodeError> for HandlerError {
    fn from(e: EncodeError) -> Self { Self::Internal(e.to_string()) }
}

impl HandlerError {
    pub fn internal(e: impl fmt::Display) -> Self {
        Self::Internal(e.to_string())
    }

    /// The `(code, message)` pair sent in `rpc_error`.
    pub fn to_wire(&self) -> (i32, String) {
        match self {
            Self::Rpc(e)      => (e.code, e.message.clone()),
            Self::Internal(s) => (0, s.clone()),
        }
    }
}

// ─── ServerError ──────────────────────────────────────────────────────────────

/// Everything that can go wrong while serving a connection.
#[derive(Debug)]
pub enum ServerError {
    /// Network / I/O failure.
    Io(io::Error),
    /// Transport framing or obfuscation failure.
    Transport(transport::Error),
    /// An envelope could not be opened.
    Envelope(envelope::Error),
    /// A protocol violation during the key exchange.
    Handshake(handshake::Error),
    /// The schema set could not be built.
    Schema(SchemaError),
    /// A response could not be encoded.
    Encode(EncodeError),
    /// A message body could not be decoded.
    Decode(deserialize::Error),
    Store(StoreError),
    Rsa(rsa::Error),
    Config(ConfigError),
    /// An encrypted message used a different key than the one bound to the connection.
    AuthKeyMismatch { bound: u64, got: u64 },
    /// An encrypted message named a key nobody registered.
    UnknownAuthKey { id: u64 },
    /// An encrypted reply was attempted on a request without an auth key.
    NoAuthKey,
    /// No RSA keys are configured.
    NotConfigured,
    /// The connection's writer has gone away.
    Closed,
    /// A blocking task panicked or was cancelled.
    Worker(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)                        => write!(f, "I/O error: {e}"),
            Self::Transport(e)                 => write!(f, "transport: {e}"),
            Self::Envelope(e)                  => write!(f, "envelope: {e}"),
            Self::Handshake(e)                 => write!(f, "handshake: {e}"),
            Self::Schema(e)                    => write!(f, "schema: {e}"),
            Self::Encode(e)                    => write!(f, "encode: {e}"),
            Self::Decode(e)                    => write!(f, "decode: {e}"),
            Self::Store(e)                     => write!(f, "store: {e}"),
            Self::Rsa(e)                       => write!(f, "RSA: {e}"),
            Self::Config(e)                    => write!(f, "{e}"),
            Self::AuthKeyMismatch { bound, got } => {
                write!(f, "auth key {got:#018x} used on a connection bound to {bound:#018x}")
            }
            Self::UnknownAuthKey { id }        => write!(f, "unknown auth key {id:#018x}"),
            Self::NoAuthKey                    => write!(f, "no auth key bound to the request"),
            Self::NotConfigured                => write!(f, "no RSA keys configured"),
            Self::Closed                       => write!(f, "connection closed"),
            Self::Worker(s)                    => write!(f, "worker task failed: {s}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e)        => Some(e),
            Self::Transport(e) => Some(e),
            Self::Envelope(e)  => Some(e),
            Self::Handshake(e) => Some(e),
            Self::Schema(e)    => Some(e),
            Self::Encode(e)    => Some(e),
            Self::Decode(e)    => Some(e),
            Self::Store(e)     => Some(e),
            Self::Rsa(e)       => Some(e),
            Self::Config(e)    => Some(e),
            _                  => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<transport::Error> for ServerError {
    fn from(e: transport::Error) -> Self { Self::Transport(e) }
}

impl From<envelope::Error> for ServerError {
    fn from(e: envelope::Error) -> Self { Self::Envelope(e) }
}

impl From<handshake::Error> for ServerError {
    fn from(e: handshake::Error) -> Self { Self::Handshake(e) }
}

impl From<SchemaError> for ServerError {
    fn from(e: SchemaError) -> Self { Self::Schema(e) }
}

impl From<EncodeError> for ServerError {
    fn from(e: EncodeError) -> Self { Self::Encode(e) }
}

impl From<deserialize::Error> for ServerError {
    fn from(e: deserialize::Error) -> Self { Self::Decode(e) }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self { Self::Store(e) }
}

impl From<rsa::Error> for ServerError {
    fn from(e: rsa::Error) -> Self { Self::Rsa(e) }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self { Self::Config(e) }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self { Self::Worker(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_patterns() {
        let err = RpcError::with_value(420, "FLOOD_WAIT", 30);
        assert_eq!(err.message, "FLOOD_WAIT_30");
        assert!(err.is("FLOOD_WAIT_*"));
        assert!(err.is("*_30"));
        assert!(!err.is("FLOOD_WAIT"));
        assert!(RpcError::method_invalid().is("*_INVALID"));
    }

    #[test]
    fn handler_errors_map_to_wire_pairs() {
        assert_eq!(HandlerError::from(RpcError::new(403, "FORBIDDEN")).to_wire(), (403, "FORBIDDEN".into()));
        assert_eq!(HandlerError::internal("boom").to_wire(), (0, "boom".into()));
    }
}
