//! Several schemas consulted in a fixed priority order.

use std::sync::Arc;

use crate::deserialize::{self, Cursor, Error};
use crate::engine::{EncodeError, Engine, Lookup, Overrides};
use crate::schema::{Combinator, FieldType, Function, Schema};
use crate::value::Value;

/// An ordered list of schemas sharing one set of [`Overrides`].
///
/// Top-level dump and load try each schema in turn and keep the first
/// success. While one schema is being tried, nested names and ids resolve
/// through that schema first and then the others in order.
#[derive(Clone, Debug, Default)]
pub struct SchemaSet {
    schemas: Vec<Arc<Schema>>,
    overrides: Overrides,
}

impl SchemaSet {
    pub fn new(schemas: impl IntoIterator<Item = Arc<Schema>>) -> Self {
        Self { schemas: schemas.into_iter().collect(), overrides: Overrides::new() }
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn schemas(&self) -> &[Arc<Schema>] {
        &self.schemas
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    /// An engine resolving through every schema in priority order.
    pub fn engine(&self) -> Engine<'_> {
        Engine::new(self).with_overrides(&self.overrides)
    }

    /// Encodes a self-describing value, trying each schema in order.
    pub fn dump(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        let root = match value {
            Value::Object(o) => Root::Combinator(&o.name),
            Value::Call(c) => Root::Function(&c.name),
            _ => return self.engine().dump(value),
        };

        let mut attempts = Vec::new();
        for (i, schema) in self.schemas.iter().enumerate() {
            let owned = match root {
                Root::Combinator(name) => schema.combinator_by_name(name).is_some(),
                Root::Function(name) => schema.function_by_name(name).is_some(),
            };
            if !owned {
                attempts.push(root.missing());
                continue;
            }
            let view = Prioritized { set: self, first: i };
            match Engine::new(&view).with_overrides(&self.overrides).dump(value) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => attempts.push(e),
            }
        }
        Err(EncodeError::NoMatchingSchema { attempts })
    }

    /// Encodes `value` as the declared `ty`, resolving through all schemas.
    pub fn dump_typed(&self, ty: &FieldType, value: &Value) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        self.engine().dump_typed("result", "value", ty, value, &mut out)?;
        Ok(out)
    }

    /// Decodes one self-describing value, trying each schema in order.
    /// Returns the value and the number of bytes consumed.
    pub fn load(&self, bytes: &[u8]) -> deserialize::Result<(Value, usize)> {
        let id = Cursor::from_slice(bytes).peek_u32()?;
        let mut attempts = Vec::new();
        for (i, schema) in self.schemas.iter().enumerate() {
            if !schema.contains_id(id) {
                attempts.push(Error::UnexpectedConstructor { id });
                continue;
            }
            let view = Prioritized { set: self, first: i };
            match Engine::new(&view).with_overrides(&self.overrides).load(bytes) {
                Ok(done) => return Ok(done),
                Err(e) => attempts.push(e),
            }
        }
        // Values no schema owns (`Bool`, raw vectors) still decode natively.
        if attempts.iter().all(|e| matches!(e, Error::UnexpectedConstructor { .. })) {
            if let Ok(done) = self.engine().load(bytes) {
                return Ok(done);
            }
        }
        Err(Error::NoMatchingSchema { attempts })
    }

    /// Decodes a value of the declared `ty` from the start of `bytes`.
    pub fn load_typed(&self, ty: &FieldType, bytes: &[u8]) -> deserialize::Result<(Value, usize)> {
        let mut cur = Cursor::from_slice(bytes);
        let value = self.engine().load_typed(ty, &mut cur)?;
        Ok((value, cur.pos()))
    }

    /// Index of the first schema that owns `id`.
    pub fn owner_of(&self, id: u32) -> Option<usize> {
        self.schemas.iter().position(|s| s.contains_id(id))
    }
}

#[derive(Clone, Copy)]
enum Root<'v> {
    Combinator(&'v str),
    Function(&'v str),
}

impl Root<'_> {
    fn missing(self) -> EncodeError {
        match self {
            Root::Combinator(name) => EncodeError::UnknownCombinator { name: name.to_owned() },
            Root::Function(name) => EncodeError::UnknownFunction { name: name.to_owned() },
        }
    }
}

/// The schemas of a set with one of them moved to the front.
struct Prioritized<'s> {
    set: &'s SchemaSet,
    first: usize,
}

impl Prioritized<'_> {
    fn ordered(&self) -> impl Iterator<Item = &Schema> {
        let first = self.set.schemas.get(self.first).map(|s| &**s);
        let rest = self
            .set
            .schemas
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != self.first)
            .map(|(_, s)| &**s);
        first.into_iter().chain(rest)
    }
}

impl Lookup for Prioritized<'_> {
    fn combinator(&self, id: u32) -> Option<&Combinator> {
        self.ordered().find_map(|s| s.combinator(id))
    }
    fn combinator_by_name(&self, name: &str) -> Option<&Combinator> {
        self.ordered().find_map(|s| s.combinator_by_name(name))
    }
    fn function(&self, id: u32) -> Option<&Function> {
        self.ordered().find_map(|s| s.function(id))
    }
    fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.ordered().find_map(|s| s.function_by_name(name))
    }
}

impl Lookup for SchemaSet {
    fn combinator(&self, id: u32) -> Option<&Combinator> {
        self.schemas.iter().find_map(|s| s.combinator(id))
    }
    fn combinator_by_name(&self, name: &str) -> Option<&Combinator> {
        self.schemas.iter().find_map(|s| s.combinator_by_name(name))
    }
    fn function(&self, id: u32) -> Option<&Function> {
        self.schemas.iter().find_map(|s| s.function(id))
    }
    fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.schemas.iter().find_map(|s| s.function_by_name(name))
    }
}
