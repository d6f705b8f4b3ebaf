//! Dynamic TL values.
//!
//! A schema is only known at runtime, so encoded data is represented by the
//! [`Value`] tree instead of generated structs. Constructors become
//! [`Object`]s, function invocations become [`Call`]s.

use std::collections::BTreeMap;
use std::fmt;

/// Any value that can appear on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// `int`
    Int(i32),
    /// `long`
    Long(i64),
    /// `int128`
    Int128([u8; 16]),
    /// `int256`
    Int256([u8; 32]),
    /// `double`
    Double(f64),
    /// `Bool`
    Bool(bool),
    /// A set `flags.N?true` bit.
    True,
    /// `bytes`
    Bytes(Vec<u8>),
    /// `string`
    String(String),
    /// `Vector<T>` or `vector<T>`.
    Vector(Vec<Value>),
    /// A constructor instance.
    Object(Box<Object>),
    /// A function invocation.
    Call(Box<Call>),
    /// Already-encoded bytes, written verbatim and produced when a nested
    /// body cannot be decoded.
    Raw(Vec<u8>),
}

impl Value {
    /// Type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Int128(_) => "int128",
            Self::Int256(_) => "int256",
            Self::Double(_) => "double",
            Self::Bool(_) => "Bool",
            Self::True => "true",
            Self::Bytes(_) => "bytes",
            Self::String(_) => "string",
            Self::Vector(_) => "Vector",
            Self::Object(_) => "object",
            Self::Call(_) => "call",
            Self::Raw(_) => "raw",
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self { Self::Int(v) => Some(*v), _ => None }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self { Self::Long(v) => Some(*v), _ => None }
    }

    pub fn as_int128(&self) -> Option<&[u8; 16]> {
        match self { Self::Int128(v) => Some(v), _ => None }
    }

    pub fn as_int256(&self) -> Option<&[u8; 32]> {
        match self { Self::Int256(v) => Some(v), _ => None }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self { Self::Bool(v) => Some(*v), Self::True => Some(true), _ => None }
    }

    /// `bytes` or the UTF-8 of a `string`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) | Self::Raw(v) => Some(v),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Self::String(v) => Some(v), _ => None }
    }

    pub fn as_vector(&self) -> Option<&[Value]> {
        match self { Self::Vector(v) => Some(v), _ => None }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self { Self::Object(v) => Some(v), _ => None }
    }

    pub fn as_call(&self) -> Option<&Call> {
        match self { Self::Call(v) => Some(v), _ => None }
    }

    /// Name of the constructor or function this value carries, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Object(o) => Some(&o.name),
            Self::Call(c) => Some(&c.name),
            _ => None,
        }
    }
}

impl From<i32> for Value { fn from(v: i32) -> Self { Self::Int(v) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Self::Long(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Self::Double(v) } }
impl From<bool> for Value { fn from(v: bool) -> Self { Self::Bool(v) } }
impl From<[u8; 16]> for Value { fn from(v: [u8; 16]) -> Self { Self::Int128(v) } }
impl From<[u8; 32]> for Value { fn from(v: [u8; 32]) -> Self { Self::Int256(v) } }
impl From<Vec<u8>> for Value { fn from(v: Vec<u8>) -> Self { Self::Bytes(v) } }
impl From<String> for Value { fn from(v: String) -> Self { Self::String(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Self::String(v.to_owned()) } }
impl From<Object> for Value { fn from(v: Object) -> Self { Self::Object(Box::new(v)) } }
impl From<Call> for Value { fn from(v: Call) -> Self { Self::Call(Box::new(v)) } }

impl Value {
    /// `Vector` from anything convertible.
    pub fn vector<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Self::Vector(items.into_iter().map(Into::into).collect())
    }
}

macro_rules! named_record {
    ($(#[$doc:meta])* $ty:ident, $map:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Default, PartialEq)]
        pub struct $ty {
            /// Full name including namespace, e.g. `auth.sentCode`.
            pub name: String,
            /// Values by field name. Absent optional fields are simply missing.
            pub $map: BTreeMap<String, Value>,
        }

        impl $ty {
            pub fn new(name: impl Into<String>) -> Self {
                Self { name: name.into(), $map: BTreeMap::new() }
            }

            /// Builder-style insert.
            pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
                self.$map.insert(field.into(), value.into());
                self
            }

            pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
                self.$map.insert(field.into(), value.into());
            }

            pub fn get(&self, field: &str) -> Option<&Value> {
                self.$map.get(field)
            }

            pub fn take(&mut self, field: &str) -> Option<Value> {
                self.$map.remove(field)
            }

            pub fn int(&self, field: &str) -> Option<i32> {
                self.get(field).and_then(Value::as_int)
            }

            pub fn long(&self, field: &str) -> Option<i64> {
                self.get(field).and_then(Value::as_long)
            }

            pub fn int128(&self, field: &str) -> Option<[u8; 16]> {
                self.get(field).and_then(Value::as_int128).copied()
            }

            pub fn int256(&self, field: &str) -> Option<[u8; 32]> {
                self.get(field).and_then(Value::as_int256).copied()
            }

            pub fn bytes(&self, field: &str) -> Option<&[u8]> {
                self.get(field).and_then(Value::as_bytes)
            }

            pub fn str(&self, field: &str) -> Option<&str> {
                self.get(field).and_then(Value::as_str)
            }

            pub fn object(&self, field: &str) -> Option<&Object> {
                self.get(field).and_then(Value::as_object)
            }

            pub fn vector(&self, field: &str) -> Option<&[Value]> {
                self.get(field).and_then(Value::as_vector)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.name)?;
                for (k, v) in &self.$map {
                    write!(f, " {k}={}", Short(v))?;
                }
                Ok(())
            }
        }
    };
}

named_record!(
    /// A constructor instance: `pong{msg_id, ping_id}`.
    Object, fields
);

named_record!(
    /// A function invocation: `ping{ping_id}`.
    Call, params
);

/// Compact rendering for logs; never prints whole byte blobs.
struct Short<'a>(&'a Value);

impl fmt::Display for Short<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::True => write!(f, "true"),
            Value::String(s) if s.len() <= 32 => write!(f, "{s:?}"),
            Value::Object(o) => write!(f, "{}{{..}}", o.name),
            Value::Call(c) => write!(f, "{}(..)", c.name),
            Value::Vector(v) => write!(f, "[{} items]", v.len()),
            Value::Int128(_) => write!(f, "<int128>"),
            Value::Int256(_) => write!(f, "<int256>"),
            other => write!(f, "<{} {}B>", other.kind(), other.as_bytes().map_or(0, <[u8]>::len)),
        }
    }
}
