//! Declarative schema construction.
//!
//! ```
//! use pylon_tl::schema::{CombinatorDecl, FunctionDecl, Schema};
//!
//! let schema = Schema::builder()
//!     .combinator(
//!         CombinatorDecl::new("user")
//!             .field("id", "long")
//!             .optional("username", 0, "string")
//!             .boxed("User"),
//!     )
//!     .function(FunctionDecl::new("getUser").param("id", "long").returns("User"))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(schema.combinator_by_name("user").unwrap().id, 0x5c12f94f);
//! ```

use std::str::FromStr;

use log::debug;
use pylon_tl_parser::errors::ParseError;
use pylon_tl_parser::parse_tl_file;
use pylon_tl_parser::tl::{Category, Definition};

use super::resolve::{Known, is_builtin};
use super::{Schema, SchemaError};

/// Field list shared by both declaration kinds.
#[derive(Clone, Debug, Default)]
struct Fields {
    fields: Vec<(String, String)>,
    order: Option<Vec<String>>,
}

impl Fields {
    fn push(&mut self, name: &str, ty: &str) {
        self.fields.push((name.to_owned(), ty.to_owned()));
    }

    /// Applies `order`, returning the culprit field and reason on mismatch.
    fn ordered(&self) -> Result<Vec<(String, String)>, (Option<String>, String)> {
        let Some(order) = &self.order else {
            return Ok(self.fields.clone());
        };
        for (name, _) in &self.fields {
            if !order.contains(name) {
                return Err((Some(name.clone()), "missing from the field order".into()));
            }
        }
        let mut out = Vec::with_capacity(order.len());
        for name in order {
            match self.fields.iter().find(|(n, _)| n == name) {
                Some(f) if !out.contains(f) => out.push(f.clone()),
                Some(_) => return Err((Some(name.clone()), "listed twice in the field order".into())),
                None => return Err((Some(name.clone()), "ordered but never declared".into())),
            }
        }
        Ok(out)
    }

    /// `flags:# a:int b:flags.0?string`, with the flags word only when needed.
    fn render(&self, fields: &[(String, String)]) -> Result<String, (Option<String>, String)> {
        let mut out = String::new();
        if fields.iter().any(|(_, ty)| ty.contains('?')) {
            out.push_str(" flags:#");
        }
        for (name, ty) in fields {
            if name.is_empty() {
                return Err((None, "field without a name".into()));
            }
            if name == "flags" {
                return Err((Some(name.clone()), "`flags` is reserved for the flags word".into()));
            }
            if ty.is_empty() || ty.contains(char::is_whitespace) {
                return Err((Some(name.clone()), format!("malformed type `{ty}`")));
            }
            out.push_str(&format!(" {name}:{ty}"));
        }
        Ok(out)
    }
}

fn check_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("missing name".into());
    }
    let valid = name
        .split('.')
        .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if valid { Ok(()) } else { Err(format!("`{name}` is not a valid name")) }
}

/// Maps a parse failure of generated text back to the field it came from.
fn param_of(error: &ParseError) -> Option<String> {
    match error {
        ParseError::InvalidParam { token, .. } => token.split(':').next().map(str::to_owned),
        _ => None,
    }
}

/// Declaration of one constructor.
#[derive(Clone, Debug)]
pub struct CombinatorDecl {
    name: String,
    id: Option<u32>,
    fields: Fields,
    boxed: Option<String>,
}

impl CombinatorDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), id: None, fields: Fields::default(), boxed: None }
    }

    /// Pins the id instead of deriving it.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Adds a field. `ty` is TL type syntax: `long`, `Vector<int>`,
    /// `%Message`, `flags.2?string`.
    pub fn field(mut self, name: &str, ty: &str) -> Self {
        self.fields.push(name, ty);
        self
    }

    /// Adds a field present only when `bit` of the flags word is set.
    pub fn optional(mut self, name: &str, bit: u32, ty: &str) -> Self {
        self.fields.push(name, &format!("flags.{bit}?{ty}"));
        self
    }

    /// Overrides the wire order. Must list every field exactly once.
    pub fn order<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.order = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Boxed type this constructor belongs to. Defaults to the name with an
    /// uppercase first letter.
    pub fn boxed(mut self, ty: impl Into<String>) -> Self {
        self.boxed = Some(ty.into());
        self
    }

    fn to_definition(&self) -> Result<Definition, SchemaError> {
        let invalid = |(field, reason): (Option<String>, String)| {
            SchemaError::combinator(&self.name, field.as_deref(), reason)
        };
        check_name(&self.name).map_err(|r| invalid((None, r)))?;

        let boxed = match &self.boxed {
            Some(b) => b.clone(),
            None => upper_first(&self.name),
        };
        let fields = self.fields.ordered().map_err(invalid)?;
        let params = self.fields.render(&fields).map_err(invalid)?;
        let id = self.id.map(|id| format!("#{id:08x}")).unwrap_or_default();

        Definition::from_str(&format!("{}{id}{params} = {boxed}", self.name))
            .map_err(|e| invalid((param_of(&e), e.to_string())))
    }

    /// The id this declaration gets, computed without a surrounding schema.
    pub fn number(&self) -> Result<u32, SchemaError> {
        Ok(self.to_definition()?.id())
    }
}

/// Declaration of one RPC function.
#[derive(Clone, Debug)]
pub struct FunctionDecl {
    name: String,
    id: Option<u32>,
    params: Fields,
    returns: Option<String>,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), id: None, params: Fields::default(), returns: None }
    }

    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    pub fn param(mut self, name: &str, ty: &str) -> Self {
        self.params.push(name, ty);
        self
    }

    pub fn optional(mut self, name: &str, bit: u32, ty: &str) -> Self {
        self.params.push(name, &format!("flags.{bit}?{ty}"));
        self
    }

    pub fn order<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.order = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn returns(mut self, ty: impl Into<String>) -> Self {
        self.returns = Some(ty.into());
        self
    }

    fn to_definition(&self) -> Result<Definition, SchemaError> {
        let invalid = |(param, reason): (Option<String>, String)| {
            SchemaError::function(&self.name, param.as_deref(), reason)
        };
        check_name(&self.name).map_err(|r| invalid((None, r)))?;

        let returns = self.returns.as_deref().ok_or_else(|| invalid((None, "missing return type".into())))?;
        let params = self.params.ordered().map_err(invalid)?;
        let rendered = self.params.render(&params).map_err(invalid)?;
        let id = self.id.map(|id| format!("#{id:08x}")).unwrap_or_default();

        let mut def = Definition::from_str(&format!("{}{id}{rendered} = {returns}", self.name))
            .map_err(|e| invalid((param_of(&e), e.to_string())))?;
        def.category = Category::Functions;
        Ok(def)
    }

    pub fn number(&self) -> Result<u32, SchemaError> {
        Ok(self.to_definition()?.id())
    }
}

fn upper_first(name: &str) -> String {
    let (ns, last) = match name.rsplit_once('.') {
        Some((ns, last)) => (Some(ns), last),
        None => (None, name),
    };
    let mut chars = last.chars();
    let upper: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    match ns {
        Some(ns) => format!("{ns}.{upper}"),
        None => upper,
    }
}

/// Collects declarations, then validates and numbers them all at once.
///
/// Errors are deferred to [`SchemaBuilder::build`] so declarations can be
/// chained.
#[derive(Default)]
pub struct SchemaBuilder {
    definitions: Vec<Definition>,
    known: Known,
    error: Option<SchemaError>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, def: Result<Definition, SchemaError>) -> Self {
        match def {
            Ok(def) => self.definitions.push(def),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn combinator(self, decl: CombinatorDecl) -> Self {
        let def = decl.to_definition();
        self.push(def)
    }

    pub fn function(self, decl: FunctionDecl) -> Self {
        let def = decl.to_definition();
        self.push(def)
    }

    /// Adds every definition in TL `source`.
    pub fn tl(mut self, source: &str) -> Self {
        for (i, def) in parse_tl_file(source).enumerate() {
            let def = def.map_err(|error| SchemaError::Parse { definition: format!("definition #{}", i + 1), error });
            match def {
                Ok(def) if is_builtin(&def) => debug!("[pylon-tl] skipping builtin `{}`", def.name),
                other => self = self.push(other),
            }
        }
        self
    }

    /// Lets declarations refer to the types and constructors of `other`.
    pub fn depends_on(mut self, other: &Schema) -> Self {
        self.known.add_schema(other);
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let mut known = self.known;
        for def in &self.definitions {
            known.add_definition(def);
        }

        let mut schema = Schema::default();
        for def in &self.definitions {
            match def.category {
                Category::Types => schema.insert_combinator(known.combinator(def)?)?,
                Category::Functions => schema.insert_function(known.function(def)?)?,
            }
        }
        debug!(
            "[pylon-tl] schema built: {} constructors, {} functions",
            schema.combinators().len(),
            schema.functions().len()
        );
        Ok(schema)
    }
}
