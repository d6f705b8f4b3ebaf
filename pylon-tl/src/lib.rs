//! Runtime TL schema engine.
//!
//! | Module          | Contents                                                    |
//! |-----------------|-------------------------------------------------------------|
//! | [`serialize`]   | [`Serializable`] and the primitive encoders                 |
//! | [`deserialize`] | [`Deserializable`], [`Cursor`] and decode errors            |
//! | [`primitives`]  | slice-level `dump_*`/`load_*` returning consumed byte counts |
//! | [`schema`]      | validated registries, declarative builders, TL text input   |
//! | [`engine`]      | schema-driven encode/decode of dynamic [`Value`]s           |
//! | [`set`]         | several schemas tried in priority order                     |
//! | [`export`]      | JSON and canonical TL text output                           |
//!
//! ```rust
//! use pylon_tl::{Object, Schema, Value, dump, load};
//!
//! let schema = Schema::from_tl("pong#347773c5 msg_id:long ping_id:long = Pong;").unwrap();
//! let pong = Value::from(Object::new("pong").with("msg_id", 1i64).with("ping_id", 2i64));
//!
//! let bytes = dump(&schema, &pong).unwrap();
//! assert_eq!(&bytes[..4], &0x347773c5u32.to_le_bytes());
//! assert_eq!(load(&schema, &bytes).unwrap(), (pong, 20));
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
pub mod engine;
pub mod export;
pub mod primitives;
pub mod schema;
pub mod serialize;
pub mod set;
mod value;

pub use deserialize::{Cursor, Deserializable};
pub use engine::{CustomCodec, EncodeError, Engine, Lookup, Overrides, dump, load};
pub use schema::{Combinator, FieldType, Function, Scalar, Schema, SchemaError};
pub use serialize::Serializable;
pub use set::SchemaSet;
pub use value::{Call, Object, Value};

/// Constructor id of a boxed `Vector`.
pub const VECTOR_ID: u32 = 0x1cb5c415;
/// `boolTrue#997275b5`
pub const BOOL_TRUE_ID: u32 = 0x997275b5;
/// `boolFalse#bc799737`
pub const BOOL_FALSE_ID: u32 = 0xbc799737;

/// Bare vector: `vector` (lowercase) as opposed to the boxed `Vector`.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);
