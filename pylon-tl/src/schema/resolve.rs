//! Turns parsed [`Definition`]s into resolved combinators and functions.

use std::collections::HashSet;

use pylon_tl_parser::crc32;
use pylon_tl_parser::tl::{Category, Definition, ParameterType, Type};

use super::{Combinator, Field, FieldType, Function, Scalar, Schema, SchemaError, Shape};

/// Definitions the engine implements natively; TL sources often restate them.
const BUILTIN: &[&str] = &["boolFalse", "boolTrue", "true", "vector", "null"];

pub(crate) fn is_builtin(def: &Definition) -> bool {
    def.namespace.is_empty() && def.category == Category::Types && BUILTIN.contains(&def.name.as_str())
}

/// Names a definition may refer to.
#[derive(Default)]
pub(crate) struct Known {
    pub combinators: HashSet<String>,
    pub types: HashSet<String>,
}

impl Known {
    pub fn add_schema(&mut self, schema: &Schema) {
        for c in schema.combinators() {
            self.combinators.insert(c.name.clone());
            self.types.insert(c.boxed_type.clone());
        }
    }

    pub fn add_definition(&mut self, def: &Definition) {
        if def.category == Category::Types {
            self.combinators.insert(def.full_name());
            self.types.insert(def.ty.full_name());
        }
    }

    fn resolve(&self, ty: &Type) -> Result<FieldType, String> {
        if ty.generic_ref {
            return Ok(FieldType::Any);
        }
        if ty.is_vector() {
            let arg = ty.generic_arg.as_deref().ok_or("vector without element type")?;
            let inner = Box::new(self.resolve(arg)?);
            if matches!(*inner, FieldType::Scalar(Scalar::True)) {
                return Err("vector of `true`".into());
            }
            return Ok(if ty.bare { FieldType::BareVector(inner) } else { FieldType::Vector(inner) });
        }
        if ty.generic_arg.is_some() {
            return Err(format!("`{}` does not take a type argument", ty.full_name()));
        }

        let name = ty.full_name();
        if ty.percent {
            let bare = lower_first(&name);
            return if self.combinators.contains(&bare) {
                Ok(FieldType::Bare(bare))
            } else {
                Err(format!("no constructor `{bare}` for `%{name}`"))
            };
        }
        if let Some(scalar) = ty.namespace.is_empty().then(|| Scalar::from_name(&ty.name)).flatten() {
            return Ok(FieldType::Scalar(scalar));
        }
        if name == "Object" {
            return Ok(FieldType::Any);
        }
        if self.types.contains(&name) {
            return Ok(FieldType::Boxed(name));
        }
        if self.combinators.contains(&name) {
            return Ok(FieldType::Bare(name));
        }
        Err(format!("unknown type `{ty}`"))
    }

    /// Resolves the parameter list; errors carry the offending field name.
    fn shape(&self, def: &Definition) -> Result<Shape, (Option<String>, String)> {
        let mut flags = None;
        let mut fields = Vec::with_capacity(def.params.len());

        for (i, p) in def.params.iter().enumerate() {
            match &p.ty {
                ParameterType::Flags if i == 0 => flags = Some(p.name.clone()),
                ParameterType::Flags => {
                    return Err((Some(p.name.clone()), "only a single leading flags field is supported".into()));
                }
                ParameterType::Normal { ty, flag } => {
                    let resolved = self.resolve(ty).map_err(|e| (Some(p.name.clone()), e))?;
                    if resolved == FieldType::Scalar(Scalar::True) && flag.is_none() {
                        return Err((Some(p.name.clone()), "`true` is only valid behind a flag".into()));
                    }
                    if fields.iter().any(|f: &Field| f.name == p.name) || flags.as_deref() == Some(&p.name) {
                        return Err((Some(p.name.clone()), "declared twice".into()));
                    }
                    fields.push(Field { name: p.name.clone(), ty: resolved, flag: flag.as_ref().map(|f| f.index) });
                }
            }
        }
        Ok(Shape { flags, fields })
    }

    pub fn combinator(&self, def: &Definition) -> Result<Combinator, SchemaError> {
        let name = def.full_name();
        if def.ty.bare || def.ty.generic_ref || def.ty.generic_arg.is_some() {
            return Err(SchemaError::combinator(&name, None, format!("`{}` is not a boxed type", def.ty)));
        }
        let shape = self
            .shape(def)
            .map_err(|(field, reason)| SchemaError::combinator(&name, field.as_deref(), reason))?;

        let mut c = Combinator { id: 0, name, shape, boxed_type: def.ty.full_name() };
        c.id = def.explicit_id.unwrap_or_else(|| crc32(c.numbering().as_bytes()));
        Ok(c)
    }

    pub fn function(&self, def: &Definition) -> Result<Function, SchemaError> {
        let name = def.full_name();
        let shape = self
            .shape(def)
            .map_err(|(param, reason)| SchemaError::function(&name, param.as_deref(), reason))?;
        let returns = self
            .resolve(&def.ty)
            .map_err(|reason| SchemaError::function(&name, None, format!("return type: {reason}")))?;
        if returns == FieldType::Scalar(Scalar::True) {
            return Err(SchemaError::function(&name, None, "return type cannot be `true`"));
        }

        let mut f = Function { id: 0, name, shape, returns };
        f.id = def.explicit_id.unwrap_or_else(|| crc32(f.numbering().as_bytes()));
        Ok(f)
    }
}

pub(crate) fn lower_first(name: &str) -> String {
    // Only the last segment is lowered: `%auth.Foo` names `auth.foo`.
    let (ns, last) = match name.rsplit_once('.') {
        Some((ns, last)) => (Some(ns), last),
        None => (None, name),
    };
    let mut chars = last.chars();
    let lowered: String = match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    };
    match ns {
        Some(ns) => format!("{ns}.{lowered}"),
        None => lowered,
    }
}
