//! Schema-driven encoding and decoding of [`Value`]s.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::deserialize::{self, Cursor, Deserializable, Error, read_len};
use crate::schema::{Combinator, Field, FieldType, Function, Scalar, Schema, Shape};
use crate::serialize::{Serializable, check_bytes_len};
use crate::value::{Call, Object, Value};
use crate::{BOOL_FALSE_ID, BOOL_TRUE_ID, VECTOR_ID};

/// Objects nested deeper than this are rejected on decode.
const MAX_DEPTH: u32 = 64;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Why a value could not be encoded.
#[derive(Clone, Debug, PartialEq)]
pub enum EncodeError {
    UnknownCombinator { name: String },
    UnknownFunction { name: String },
    MissingField { owner: String, field: String },
    TypeMismatch { owner: String, field: String, expected: String, found: &'static str },
    /// An object was given where a different boxed type (or bare
    /// constructor) is declared.
    WrongType { name: String, expected: String },
    /// A scalar was given where only self-describing values can go.
    Untyped { found: &'static str },
    /// A byte string longer than its length prefix can describe.
    TooLong { len: usize, max: usize },
    /// Every candidate schema rejected the value.
    NoMatchingSchema { attempts: Vec<EncodeError> },
    Custom(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCombinator { name } => write!(f, "unknown constructor `{name}`"),
            Self::UnknownFunction { name } => write!(f, "unknown function `{name}`"),
            Self::MissingField { owner, field } => write!(f, "`{owner}` is missing field `{field}`"),
            Self::TypeMismatch { owner, field, expected, found } => {
                write!(f, "`{owner}.{field}` expects {expected}, got {found}")
            }
            Self::WrongType { name, expected } => write!(f, "`{name}` is not a {expected}"),
            Self::Untyped { found } => write!(f, "cannot encode a bare {found} without a declared type"),
            Self::TooLong { len, max } => write!(f, "byte string of {len} bytes exceeds the {max}-byte limit"),
            Self::NoMatchingSchema { attempts } => {
                write!(f, "no schema could encode the value")?;
                for (i, e) in attempts.iter().enumerate() {
                    write!(f, "; #{i}: {e}")?;
                }
                Ok(())
            }
            Self::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for EncodeError {}

// ─── Lookup ──────────────────────────────────────────────────────────────────

/// Id and name resolution the engine walks values with.
pub trait Lookup {
    fn combinator(&self, id: u32) -> Option<&Combinator>;
    fn combinator_by_name(&self, name: &str) -> Option<&Combinator>;
    fn function(&self, id: u32) -> Option<&Function>;
    fn function_by_name(&self, name: &str) -> Option<&Function>;
}

impl Lookup for Schema {
    fn combinator(&self, id: u32) -> Option<&Combinator> { Schema::combinator(self, id) }
    fn combinator_by_name(&self, name: &str) -> Option<&Combinator> { Schema::combinator_by_name(self, name) }
    fn function(&self, id: u32) -> Option<&Function> { Schema::function(self, id) }
    fn function_by_name(&self, name: &str) -> Option<&Function> { Schema::function_by_name(self, name) }
}

// ─── Overrides ───────────────────────────────────────────────────────────────

/// Hand-written body codec for one constructor, used instead of the generic
/// field walk. The constructor id itself is handled by the engine.
pub trait CustomCodec: Send + Sync {
    fn dump(&self, engine: &Engine<'_>, object: &Object, out: &mut Vec<u8>) -> Result<(), EncodeError>;
    fn load(&self, engine: &Engine<'_>, buf: &mut Cursor<'_>) -> deserialize::Result<Object>;
}

/// Custom codecs keyed by constructor id.
#[derive(Clone, Default)]
pub struct Overrides {
    by_id: HashMap<u32, Arc<dyn CustomCodec>>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u32, codec: Arc<dyn CustomCodec>) {
        self.by_id.insert(id, codec);
    }

    pub fn with(mut self, id: u32, codec: Arc<dyn CustomCodec>) -> Self {
        self.insert(id, codec);
        self
    }

    pub fn get(&self, id: u32) -> Option<&Arc<dyn CustomCodec>> {
        self.by_id.get(&id)
    }
}

impl fmt::Debug for Overrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_id.keys().map(|id| format!("{id:#010x}"))).finish()
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// A borrowed view over a [`Lookup`] plus optional [`Overrides`].
#[derive(Clone, Copy)]
pub struct Engine<'a> {
    lookup: &'a dyn Lookup,
    overrides: Option<&'a Overrides>,
    depth: u32,
}

impl<'a> Engine<'a> {
    pub fn new(lookup: &'a dyn Lookup) -> Self {
        Self { lookup, overrides: None, depth: 0 }
    }

    pub fn with_overrides(mut self, overrides: &'a Overrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn lookup(&self) -> &'a dyn Lookup {
        self.lookup
    }

    fn custom(&self, id: u32) -> Option<&'a Arc<dyn CustomCodec>> {
        self.overrides.and_then(|o| o.get(id))
    }

    fn nested(&self) -> deserialize::Result<Self> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::Custom(format!("objects nested deeper than {MAX_DEPTH}")));
        }
        Ok(Self { depth: self.depth + 1, ..*self })
    }

    // ─── dump ────────────────────────────────────────────────────────────────

    /// Encodes a self-describing value (object, call, `Bool`, vector of
    /// those, or raw bytes).
    pub fn dump(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        self.dump_any(value, &mut out)?;
        Ok(out)
    }

    pub fn dump_any(&self, value: &Value, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        match value {
            Value::Object(o) => self.dump_object(o, out),
            Value::Call(c) => self.dump_call(c, out),
            Value::Bool(b) => {
                b.serialize(out);
                Ok(())
            }
            Value::Vector(items) => {
                VECTOR_ID.serialize(out);
                (items.len() as i32).serialize(out);
                items.iter().try_for_each(|v| self.dump_any(v, out))
            }
            Value::Raw(bytes) => {
                out.extend_from_slice(bytes);
                Ok(())
            }
            other => Err(EncodeError::Untyped { found: other.kind() }),
        }
    }

    /// Boxed encoding: constructor id followed by the body.
    pub fn dump_object(&self, object: &Object, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let c = self
            .lookup
            .combinator_by_name(&object.name)
            .ok_or_else(|| EncodeError::UnknownCombinator { name: object.name.clone() })?;
        c.id.serialize(out);
        self.dump_bare(c, object, out)
    }

    /// Bare encoding: the body only.
    pub fn dump_bare(&self, c: &Combinator, object: &Object, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        match self.custom(c.id) {
            Some(codec) => codec.dump(self, object, out),
            None => self.dump_shape(&c.name, &c.shape, &object.fields, out),
        }
    }

    pub fn dump_call(&self, call: &Call, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let f = self
            .lookup
            .function_by_name(&call.name)
            .ok_or_else(|| EncodeError::UnknownFunction { name: call.name.clone() })?;
        f.id.serialize(out);
        self.dump_shape(&f.name, &f.shape, &call.params, out)
    }

    /// Flags word (when the shape has one) followed by every present field.
    pub fn dump_shape(
        &self,
        owner: &str,
        shape: &Shape,
        values: &BTreeMap<String, Value>,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodeError> {
        if shape.flags.is_some() {
            let word = shape
                .fields
                .iter()
                .filter(|f| is_present(f, values))
                .filter_map(|f| f.flag)
                .fold(0u32, |acc, bit| acc | (1 << bit));
            word.serialize(out);
        }

        for field in &shape.fields {
            if field.is_optional() && !is_present(field, values) {
                continue;
            }
            if field.ty == FieldType::Scalar(Scalar::True) {
                continue;
            }
            let value = values.get(&field.name).ok_or_else(|| EncodeError::MissingField {
                owner: owner.to_owned(),
                field: field.name.clone(),
            })?;
            self.dump_typed(owner, &field.name, &field.ty, value, out)?;
        }
        Ok(())
    }

    /// Encodes `value` as the declared `ty`.
    pub fn dump_typed(
        &self,
        owner: &str,
        field: &str,
        ty: &FieldType,
        value: &Value,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodeError> {
        let mismatch = || EncodeError::TypeMismatch {
            owner: owner.to_owned(),
            field: field.to_owned(),
            expected: ty.to_string(),
            found: value.kind(),
        };

        match (ty, value) {
            (_, Value::Raw(bytes)) => out.extend_from_slice(bytes),
            (FieldType::Scalar(s), v) => match (s, v) {
                (Scalar::Int, Value::Int(x)) => x.serialize(out),
                (Scalar::Long, Value::Long(x)) => x.serialize(out),
                (Scalar::Int128, Value::Int128(x)) => x.serialize(out),
                (Scalar::Int256, Value::Int256(x)) => x.serialize(out),
                (Scalar::Double, Value::Double(x)) => x.serialize(out),
                (Scalar::Bool, Value::Bool(x)) => x.serialize(out),
                (Scalar::Bytes, Value::Bytes(x)) => {
                    check_bytes_len(x.len())?;
                    x.serialize(out)
                }
                (Scalar::Bytes | Scalar::String, Value::String(x)) => {
                    check_bytes_len(x.len())?;
                    x.serialize(out)
                }
                (Scalar::True, Value::True | Value::Bool(true)) => {}
                _ => return Err(mismatch()),
            },
            (FieldType::Any, v) => self.dump_any(v, out)?,
            (FieldType::Boxed(expected), Value::Object(o)) => {
                let c = self
                    .lookup
                    .combinator_by_name(&o.name)
                    .ok_or_else(|| EncodeError::UnknownCombinator { name: o.name.clone() })?;
                if &c.boxed_type != expected {
                    return Err(EncodeError::WrongType { name: o.name.clone(), expected: expected.clone() });
                }
                c.id.serialize(out);
                self.dump_bare(c, o, out)?;
            }
            (FieldType::Bare(expected), Value::Object(o)) => {
                if &o.name != expected {
                    return Err(EncodeError::WrongType { name: o.name.clone(), expected: expected.clone() });
                }
                let c = self
                    .lookup
                    .combinator_by_name(&o.name)
                    .ok_or_else(|| EncodeError::UnknownCombinator { name: o.name.clone() })?;
                self.dump_bare(c, o, out)?;
            }
            (FieldType::Vector(inner) | FieldType::BareVector(inner), Value::Vector(items)) => {
                if matches!(ty, FieldType::Vector(_)) {
                    VECTOR_ID.serialize(out);
                }
                (items.len() as i32).serialize(out);
                for item in items {
                    self.dump_typed(owner, field, inner, item, out)?;
                }
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    // ─── load ────────────────────────────────────────────────────────────────

    /// Decodes one self-describing value from the start of `bytes`,
    /// returning it with the number of bytes consumed.
    pub fn load(&self, bytes: &[u8]) -> deserialize::Result<(Value, usize)> {
        let mut cur = Cursor::from_slice(bytes);
        let value = self.load_any(&mut cur)?;
        Ok((value, cur.pos()))
    }

    /// Reads an id and dispatches on it: constructor, function or `Bool`.
    pub fn load_any(&self, buf: &mut Cursor<'_>) -> deserialize::Result<Value> {
        let id = buf.peek_u32()?;
        match id {
            VECTOR_ID => Err(Error::UntypedVector),
            BOOL_TRUE_ID | BOOL_FALSE_ID => Ok(Value::Bool(bool::deserialize(buf)?)),
            _ => {
                if let Some(c) = self.lookup.combinator(id) {
                    u32::deserialize(buf)?;
                    Ok(Value::Object(Box::new(self.load_bare(c, buf)?)))
                } else if let Some(f) = self.lookup.function(id) {
                    u32::deserialize(buf)?;
                    Ok(Value::Call(Box::new(self.load_call_body(f, buf)?)))
                } else {
                    Err(Error::UnexpectedConstructor { id })
                }
            }
        }
    }

    /// Boxed constructor of any type.
    pub fn load_object(&self, buf: &mut Cursor<'_>) -> deserialize::Result<Object> {
        let id = u32::deserialize(buf)?;
        let c = self.lookup.combinator(id).ok_or(Error::UnexpectedConstructor { id })?;
        self.load_bare(c, buf)
    }

    pub fn load_bare(&self, c: &Combinator, buf: &mut Cursor<'_>) -> deserialize::Result<Object> {
        let inner = self.nested()?;
        match self.custom(c.id) {
            Some(codec) => codec.load(&inner, buf),
            None => Ok(Object { name: c.name.clone(), fields: inner.load_shape(&c.shape, buf)? }),
        }
    }

    /// Function id followed by its parameters.
    pub fn load_call(&self, buf: &mut Cursor<'_>) -> deserialize::Result<Call> {
        let id = u32::deserialize(buf)?;
        let f = self.lookup.function(id).ok_or(Error::UnexpectedConstructor { id })?;
        self.load_call_body(f, buf)
    }

    fn load_call_body(&self, f: &Function, buf: &mut Cursor<'_>) -> deserialize::Result<Call> {
        let inner = self.nested()?;
        Ok(Call { name: f.name.clone(), params: inner.load_shape(&f.shape, buf)? })
    }

    pub fn load_shape(&self, shape: &Shape, buf: &mut Cursor<'_>) -> deserialize::Result<BTreeMap<String, Value>> {
        let flags = match shape.flags {
            Some(_) => u32::deserialize(buf)?,
            None => 0,
        };

        let mut values = BTreeMap::new();
        for field in &shape.fields {
            if let Some(bit) = field.flag {
                if flags & (1 << bit) == 0 {
                    continue;
                }
            }
            let value = self.load_typed(&field.ty, buf)?;
            values.insert(field.name.clone(), value);
        }
        Ok(values)
    }

    /// Decodes a value of the declared `ty`.
    pub fn load_typed(&self, ty: &FieldType, buf: &mut Cursor<'_>) -> deserialize::Result<Value> {
        Ok(match ty {
            FieldType::Scalar(s) => match s {
                Scalar::Int => Value::Int(i32::deserialize(buf)?),
                Scalar::Long => Value::Long(i64::deserialize(buf)?),
                Scalar::Int128 => Value::Int128(<[u8; 16]>::deserialize(buf)?),
                Scalar::Int256 => Value::Int256(<[u8; 32]>::deserialize(buf)?),
                Scalar::Double => Value::Double(f64::deserialize(buf)?),
                Scalar::Bool => Value::Bool(bool::deserialize(buf)?),
                Scalar::Bytes => Value::Bytes(Vec::<u8>::deserialize(buf)?),
                Scalar::String => Value::String(String::deserialize(buf)?),
                Scalar::True => Value::True,
            },
            FieldType::Any => self.load_any(buf)?,
            FieldType::Boxed(expected) => {
                let id = u32::deserialize(buf)?;
                let c = self
                    .lookup
                    .combinator(id)
                    .filter(|c| &c.boxed_type == expected)
                    .ok_or(Error::UnexpectedConstructor { id })?;
                Value::Object(Box::new(self.load_bare(c, buf)?))
            }
            FieldType::Bare(name) => {
                let c = self
                    .lookup
                    .combinator_by_name(name)
                    .ok_or_else(|| Error::Custom(format!("unknown bare constructor `{name}`")))?;
                Value::Object(Box::new(self.load_bare(c, buf)?))
            }
            FieldType::Vector(inner) | FieldType::BareVector(inner) => {
                if matches!(ty, FieldType::Vector(_)) {
                    let id = u32::deserialize(buf)?;
                    if id != VECTOR_ID {
                        return Err(Error::BadVectorTag { id });
                    }
                }
                let len = read_len(buf)?;
                let mut items = Vec::with_capacity(len.min(buf.remaining()));
                for _ in 0..len {
                    items.push(self.load_typed(inner, buf)?);
                }
                Value::Vector(items)
            }
        })
    }
}

/// An optional field counts as present when it has a value; a `true` field
/// additionally needs that value to be truthy.
fn is_present(field: &Field, values: &BTreeMap<String, Value>) -> bool {
    match values.get(&field.name) {
        None => false,
        Some(Value::Bool(false)) => field.ty != FieldType::Scalar(Scalar::True),
        Some(_) => true,
    }
}

/// Encodes `value` using `lookup`.
pub fn dump(lookup: &dyn Lookup, value: &Value) -> Result<Vec<u8>, EncodeError> {
    Engine::new(lookup).dump(value)
}

/// Decodes one value from the start of `bytes`; returns it with the byte count.
pub fn load(lookup: &dyn Lookup, bytes: &[u8]) -> deserialize::Result<(Value, usize)> {
    Engine::new(lookup).load(bytes)
}
