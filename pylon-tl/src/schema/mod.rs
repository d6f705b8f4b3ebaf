//! Validated, immutable registries of combinators and functions.
//!
//! A [`Schema`] is built once (from TL text, from declarative
//! [`CombinatorDecl`]/[`FunctionDecl`] builders, or both) and then only read.
//! Every lookup by id or by name is a single hash-map probe.

mod decl;
mod error;
mod resolve;

use std::collections::HashMap;
use std::fmt;

pub use decl::{CombinatorDecl, FunctionDecl, SchemaBuilder};
pub use error::SchemaError;

/// Primitive wire types understood without a schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    Int,
    Long,
    Int128,
    Int256,
    Double,
    Bytes,
    String,
    Bool,
    /// Presence-only `flags.N?true`; occupies no bytes.
    True,
}

impl Scalar {
    /// Maps a TL type name to a scalar.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "int" => Self::Int,
            "long" => Self::Long,
            "int128" => Self::Int128,
            "int256" => Self::Int256,
            "double" => Self::Double,
            "bytes" => Self::Bytes,
            "string" => Self::String,
            "Bool" => Self::Bool,
            "true" => Self::True,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Long => "long",
            Self::Int128 => "int128",
            Self::Int256 => "int256",
            Self::Double => "double",
            Self::Bytes => "bytes",
            Self::String => "string",
            Self::Bool => "Bool",
            Self::True => "true",
        }
    }
}

/// The declared type of a field, parameter or return value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Scalar(Scalar),
    /// `Object` or a generic `!X`: any boxed value, self-described by its id.
    Any,
    /// A boxed type such as `Pong`; the value carries its constructor id.
    Boxed(String),
    /// A bare constructor such as `future_salt` or `%Message`; no id.
    Bare(String),
    /// `Vector<T>`, prefixed with `0x1cb5c415`.
    Vector(Box<FieldType>),
    /// `vector<T>`, count and items only.
    BareVector(Box<FieldType>),
}

impl FieldType {
    /// Appends the form used by numbering: `Vector long` instead of
    /// `Vector<long>`.
    pub fn write_numbering(&self, out: &mut String) {
        match self {
            Self::Scalar(s) => out.push_str(s.name()),
            Self::Any => out.push_str("Object"),
            Self::Boxed(n) | Self::Bare(n) => out.push_str(n),
            Self::Vector(inner) => {
                out.push_str("Vector ");
                inner.write_numbering(out);
            }
            Self::BareVector(inner) => {
                out.push_str("vector ");
                inner.write_numbering(out);
            }
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => f.write_str(s.name()),
            Self::Any => f.write_str("Object"),
            Self::Boxed(n) | Self::Bare(n) => f.write_str(n),
            Self::Vector(inner) => write!(f, "Vector<{inner}>"),
            Self::BareVector(inner) => write!(f, "vector<{inner}>"),
        }
    }
}

/// One field of a combinator or parameter of a function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    /// Bit of the leading flags word guarding this field.
    pub flag: Option<u32>,
}

impl Field {
    pub fn is_optional(&self) -> bool {
        self.flag.is_some()
    }
}

/// The parts shared by combinators and functions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape {
    /// Name of the leading `#` field, when the shape has optional fields.
    pub flags: Option<String>,
    /// Wire-order fields, not including the flags word.
    pub fields: Vec<Field>,
}

impl Shape {
    fn write_params(&self, out: &mut String, numbering: bool) {
        if let Some(flags) = &self.flags {
            out.push_str(&format!(" {flags}:#"));
        }
        for field in &self.fields {
            out.push(' ');
            out.push_str(&field.name);
            out.push(':');
            if let (Some(bit), Some(flags)) = (field.flag, &self.flags) {
                out.push_str(&format!("{flags}.{bit}?"));
            }
            if numbering {
                field.ty.write_numbering(out);
            } else {
                out.push_str(&field.ty.to_string());
            }
        }
    }
}

/// A concrete record shape belonging to one boxed type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Combinator {
    pub id: u32,
    pub name: String,
    pub shape: Shape,
    pub boxed_type: String,
}

impl Combinator {
    pub fn fields(&self) -> &[Field] {
        &self.shape.fields
    }

    /// Canonical string whose CRC32 is the derived id.
    pub fn numbering(&self) -> String {
        let mut out = self.name.clone();
        self.shape.write_params(&mut out, true);
        out.push_str(" = ");
        out.push_str(&self.boxed_type);
        out
    }
}

impl fmt::Display for Combinator {
    /// `name#id params = Type`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params = String::new();
        self.shape.write_params(&mut params, false);
        write!(f, "{}#{:08x}{} = {}", self.name, self.id, params, self.boxed_type)
    }
}

/// An RPC function: typed parameters and a return type.
///
/// The request context a handler receives is not part of the wire shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub id: u32,
    pub name: String,
    pub shape: Shape,
    pub returns: FieldType,
}

impl Function {
    pub fn params(&self) -> &[Field] {
        &self.shape.fields
    }

    /// Canonical string whose CRC32 is the derived id.
    pub fn numbering(&self) -> String {
        let mut out = self.name.clone();
        self.shape.write_params(&mut out, true);
        out.push_str(" = ");
        self.returns.write_numbering(&mut out);
        out
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params = String::new();
        self.shape.write_params(&mut params, false);
        write!(f, "{}#{:08x}{} = {}", self.name, self.id, params, self.returns)
    }
}

/// A tagged union and the ids of its variants, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoxedType {
    pub name: String,
    pub variants: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entry {
    Combinator(usize),
    Function(usize),
}

/// An immutable registry of combinators, boxed types and functions.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    combinators: Vec<Combinator>,
    functions: Vec<Function>,
    types: Vec<BoxedType>,
    ids: HashMap<u32, Entry>,
    combinator_names: HashMap<String, usize>,
    function_names: HashMap<String, usize>,
    type_names: HashMap<String, usize>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Builds a schema from TL source alone.
    pub fn from_tl(source: &str) -> Result<Self, SchemaError> {
        SchemaBuilder::new().tl(source).build()
    }

    /// Registers `c`, failing on a clashing id or name.
    fn insert_combinator(&mut self, c: Combinator) -> Result<(), SchemaError> {
        if self.combinator_names.contains_key(&c.name) {
            return Err(SchemaError::DuplicateName { name: c.name });
        }
        self.claim_id(c.id, &c.name)?;
        let idx = self.combinators.len();
        self.ids.insert(c.id, Entry::Combinator(idx));
        self.combinator_names.insert(c.name.clone(), idx);

        match self.type_names.get(&c.boxed_type) {
            Some(&t) => self.types[t].variants.push(c.id),
            None => {
                self.type_names.insert(c.boxed_type.clone(), self.types.len());
                self.types.push(BoxedType { name: c.boxed_type.clone(), variants: vec![c.id] });
            }
        }
        self.combinators.push(c);
        Ok(())
    }

    fn insert_function(&mut self, f: Function) -> Result<(), SchemaError> {
        if self.function_names.contains_key(&f.name) {
            return Err(SchemaError::DuplicateName { name: f.name });
        }
        self.claim_id(f.id, &f.name)?;
        let idx = self.functions.len();
        self.ids.insert(f.id, Entry::Function(idx));
        self.function_names.insert(f.name.clone(), idx);
        self.functions.push(f);
        Ok(())
    }

    fn claim_id(&self, id: u32, name: &str) -> Result<(), SchemaError> {
        match self.ids.get(&id) {
            None => Ok(()),
            Some(existing) => Err(SchemaError::DuplicateId {
                id,
                first: self.entry_name(*existing).to_owned(),
                second: name.to_owned(),
            }),
        }
    }

    fn entry_name(&self, entry: Entry) -> &str {
        match entry {
            Entry::Combinator(i) => &self.combinators[i].name,
            Entry::Function(i) => &self.functions[i].name,
        }
    }

    pub fn combinator(&self, id: u32) -> Option<&Combinator> {
        match self.ids.get(&id)? {
            Entry::Combinator(i) => self.combinators.get(*i),
            Entry::Function(_) => None,
        }
    }

    pub fn combinator_by_name(&self, name: &str) -> Option<&Combinator> {
        self.combinator_names.get(name).map(|&i| &self.combinators[i])
    }

    pub fn function(&self, id: u32) -> Option<&Function> {
        match self.ids.get(&id)? {
            Entry::Function(i) => self.functions.get(*i),
            Entry::Combinator(_) => None,
        }
    }

    pub fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.function_names.get(name).map(|&i| &self.functions[i])
    }

    pub fn boxed_type(&self, name: &str) -> Option<&BoxedType> {
        self.type_names.get(name).map(|&i| &self.types[i])
    }

    /// Whether any combinator or function has this id.
    pub fn contains_id(&self, id: u32) -> bool {
        self.ids.contains_key(&id)
    }

    /// Id of the combinator or function called `name`.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.combinator_by_name(name)
            .map(|c| c.id)
            .or_else(|| self.function_by_name(name).map(|f| f.id))
    }

    /// Combinators in declaration order.
    pub fn combinators(&self) -> &[Combinator] {
        &self.combinators
    }

    /// Functions in declaration order.
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn types(&self) -> &[BoxedType] {
        &self.types
    }
}
