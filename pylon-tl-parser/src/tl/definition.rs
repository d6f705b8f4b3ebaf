use std::fmt;
use std::str::FromStr;

use crate::errors::{ParamParseError, ParseError};
use crate::tl::{Category, Flag, Parameter, ParameterType, Type};
use crate::utils::tl_id;

/// A single TL definition, either a constructor or a function.
///
/// ```text
/// pong#347773c5 msg_id:long ping_id:long = Pong;
/// ```
/// becomes a `Definition` with `name = "pong"`, `explicit_id = Some(0x347773c5)`,
/// two parameters and `ty = Pong`.
#[derive(Clone, Debug, PartialEq)]
pub struct Definition {
    /// Namespace parts. Empty in the global namespace.
    pub namespace: Vec<String>,

    /// The name without namespace (`"pong"`, `"sendMessage"`).
    pub name: String,

    /// The `#hex` id when one was written out.
    pub explicit_id: Option<u32>,

    /// `{X:Type}` generic declarations in order of appearance.
    pub type_defs: Vec<String>,

    /// Parameters in wire order.
    pub params: Vec<Parameter>,

    /// The result type (boxed type of a constructor, return type of a function).
    pub ty: Type,

    /// Which section the definition came from.
    pub category: Category,
}

impl Definition {
    /// `namespace.name` joined with dots.
    pub fn full_name(&self) -> String {
        let mut s = String::new();
        for ns in &self.namespace {
            s.push_str(ns);
            s.push('.');
        }
        s.push_str(&self.name);
        s
    }

    /// The 32-bit id: the explicit `#hex` if present, otherwise the CRC32 of
    /// [`Definition::numbering`].
    pub fn id(&self) -> u32 {
        self.explicit_id.unwrap_or_else(|| tl_id(&self.numbering()))
    }

    /// The canonical string that numbering hashes, e.g.
    /// `msgs_ack msg_ids:Vector long = MsgsAck`.
    pub fn numbering(&self) -> String {
        let mut out = self.full_name();
        for g in &self.type_defs {
            out.push_str(&format!(" {{{g}:Type}}"));
        }
        for p in &self.params {
            out.push(' ');
            out.push_str(&p.name);
            out.push(':');
            p.ty.write_numbering(&mut out);
        }
        out.push_str(" = ");
        self.ty.write_numbering(&mut out);
        out
    }
}

impl fmt::Display for Definition {
    /// Writes `name#id params = Type` without the trailing `;`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:08x}", self.full_name(), self.id())?;

        let mut generics: Vec<&str> = self.type_defs.iter().map(String::as_str).collect();
        for p in &self.params {
            if let ParameterType::Normal { ty, .. } = &p.ty {
                ty.collect_generic_refs(&mut generics);
            }
        }
        let mut seen = Vec::new();
        generics.retain(|g| {
            if seen.contains(g) {
                false
            } else {
                seen.push(*g);
                true
            }
        });
        for g in generics {
            write!(f, " {{{g}:Type}}")?;
        }

        for p in &self.params {
            write!(f, " {p}")?;
        }
        write!(f, " = {}", self.ty)
    }
}

impl FromStr for Definition {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim().trim_end_matches(';').trim();
        if raw.is_empty() {
            return Err(ParseError::Empty);
        }

        let (lhs, ty_str) = raw.split_once('=').ok_or(ParseError::MissingType)?;
        let lhs = lhs.trim();
        let ty_str = ty_str.trim();
        if ty_str.is_empty() || ty_str.contains(char::is_whitespace) {
            return Err(ParseError::MissingType);
        }
        let mut ty = Type::from_str(ty_str).map_err(|_| ParseError::MissingType)?;

        let (head, rest) = match lhs.split_once(char::is_whitespace) {
            Some((h, r)) => (h, r.trim_start()),
            None => (lhs, ""),
        };

        let (full_name, explicit_id) = match head.split_once('#') {
            Some((n, id)) => (n, Some(u32::from_str_radix(id.trim(), 16).map_err(ParseError::InvalidId)?)),
            None => (head, None),
        };

        let (namespace, name) = match full_name.rsplit_once('.') {
            Some((ns, n)) => (ns.split('.').map(String::from).collect::<Vec<_>>(), n),
            None => (Vec::new(), full_name),
        };
        if namespace.iter().any(|p| p.is_empty())
            || name.is_empty()
            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ParseError::MissingName);
        }

        let mut type_defs: Vec<String> = Vec::new();
        let mut flag_defs: Vec<String> = Vec::new();
        let mut params = Vec::new();

        for token in rest.split_whitespace() {
            let invalid = |error| ParseError::InvalidParam { token: token.to_owned(), error };
            let p = match Parameter::from_str(token) {
                Ok(p) => p,
                Err(ParamParseError::TypeDef { name }) => {
                    type_defs.push(name);
                    continue;
                }
                Err(ParamParseError::NotImplemented) => return Err(ParseError::NotImplemented),
                Err(e) => return Err(invalid(e)),
            };

            match &p.ty {
                ParameterType::Flags => flag_defs.push(p.name.clone()),
                ParameterType::Normal { ty: Type { name: tn, generic_ref: true, .. }, .. }
                    if !type_defs.contains(tn) =>
                {
                    return Err(invalid(ParamParseError::MissingDef));
                }
                ParameterType::Normal { flag: Some(Flag { name: fname, .. }), .. }
                    if !flag_defs.contains(fname) =>
                {
                    return Err(invalid(ParamParseError::MissingDef));
                }
                _ => {}
            }
            params.push(p);
        }

        if type_defs.contains(&ty.name) {
            ty.generic_ref = true;
        }

        Ok(Definition {
            namespace,
            name: name.to_owned(),
            explicit_id,
            type_defs,
            params,
            ty,
            category: Category::Types,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_string() {
        let def: Definition = "msgs_ack#62d6b459 msg_ids:Vector<long> = MsgsAck".parse().unwrap();
        assert_eq!(def.numbering(), "msgs_ack msg_ids:Vector long = MsgsAck");
        assert_eq!(tl_id(&def.numbering()), 0x62d6b459);
    }

    #[test]
    fn display_round_trips_through_parse() {
        let src = "user#5c12f94f flags:# id:long username:flags.0?string = User";
        let def: Definition = src.parse().unwrap();
        assert_eq!(def.to_string(), src);
    }

    #[test]
    fn undeclared_flags_field() {
        let err = "a x:flags.0?int = A".parse::<Definition>().unwrap_err();
        assert!(matches!(err, ParseError::InvalidParam { error: ParamParseError::MissingDef, .. }));
    }

    #[test]
    fn generic_return_type() {
        let def: Definition = "invokeWithLayer#da9b0d0d {X:Type} layer:int query:!X = X".parse().unwrap();
        assert!(def.ty.generic_ref);
        assert_eq!(def.type_defs, vec!["X".to_owned()]);
        assert_eq!(def.id(), 0xda9b0d0d);
    }
}
