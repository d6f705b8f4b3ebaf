use std::fmt;
use std::str::FromStr;

use crate::errors::ParamParseError;

/// A type expression such as `long`, `Vector<long>`, `%Message` or `!X`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Type {
    /// Namespace components, e.g. `["auth"]` for `auth.Authorization`.
    pub namespace: Vec<String>,

    /// The name as written, without `%`, `!` or a generic argument.
    pub name: String,

    /// Lowercase first letter: a bare constructor or a primitive.
    pub bare: bool,

    /// Written as `%Name`: the bare form of the single constructor of boxed
    /// type `Name`.
    pub percent: bool,

    /// Written as `!X`: a reference to a `{X:Type}` generic.
    pub generic_ref: bool,

    /// Argument of `Vector<...>` / `vector<...>`.
    pub generic_arg: Option<Box<Type>>,
}

impl Type {
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

    /// Whether this is the builtin `Vector`/`vector` container.
    pub fn is_vector(&self) -> bool {
        self.namespace.is_empty() && (self.name == "Vector" || self.name == "vector")
    }

    /// Appends the form of this type used in numbering strings: generic
    /// arguments separated by a space and `%Name` written as the bare
    /// lowercase name.
    pub fn write_numbering(&self, out: &mut String) {
        for ns in &self.namespace {
            out.push_str(ns);
            out.push('.');
        }
        if self.generic_ref {
            out.push('!');
        }
        if self.percent {
            let mut chars = self.name.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_lowercase());
                out.push_str(chars.as_str());
            }
        } else {
            out.push_str(&self.name);
        }
        if let Some(arg) = &self.generic_arg {
            out.push(' ');
            arg.write_numbering(out);
        }
    }

    pub(crate) fn collect_generic_refs<'a>(&'a self, output: &mut Vec<&'a str>) {
        if self.generic_ref {
            output.push(&self.name);
        }
        if let Some(arg) = &self.generic_arg {
            arg.collect_generic_refs(output);
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.percent {
            write!(f, "%")?;
        }
        if self.generic_ref {
            write!(f, "!")?;
        }
        for ns in &self.namespace {
            write!(f, "{ns}.")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(arg) = &self.generic_arg {
            write!(f, "<{arg}>")?;
        }
        Ok(())
    }
}

impl FromStr for Type {
    type Err = ParamParseError;

    /// Parses a type expression.
    ///
    /// ```
    /// use pylon_tl_parser::tl::Type;
    /// assert!("Vector<long>".parse::<Type>().is_ok());
    /// assert!("vector<%Message>".parse::<Type>().is_ok());
    /// assert!("!X".parse::<Type>().is_ok());
    /// ```
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (raw, percent) = match raw.strip_prefix('%') {
            Some(r) => (r, true),
            None => (raw, false),
        };
        let (raw, generic_ref) = match raw.strip_prefix('!') {
            Some(r) => (r, true),
            None => (raw, false),
        };

        let (name_part, generic_arg) = match raw.split_once('<') {
            Some((name, rest)) => match rest.strip_suffix('>') {
                Some(arg) => (name, Some(Box::new(Type::from_str(arg)?))),
                None => return Err(ParamParseError::InvalidGeneric),
            },
            None => (raw, None),
        };

        let (namespace, name) = match name_part.rsplit_once('.') {
            Some((ns, n)) => (ns.split('.').map(String::from).collect::<Vec<_>>(), n),
            None => (Vec::new(), name_part),
        };
        if namespace.iter().any(|p| p.is_empty()) {
            return Err(ParamParseError::Empty);
        }

        let first = name.chars().next().ok_or(ParamParseError::Empty)?;
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ParamParseError::InvalidGeneric);
        }

        Ok(Self {
            namespace,
            name: name.to_owned(),
            bare: first.is_ascii_lowercase(),
            percent,
            generic_ref,
            generic_arg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbering(s: &str) -> String {
        let mut out = String::new();
        s.parse::<Type>().unwrap().write_numbering(&mut out);
        out
    }

    #[test]
    fn numbering_forms() {
        assert_eq!(numbering("Vector<long>"), "Vector long");
        assert_eq!(numbering("vector<%Message>"), "vector message");
        assert_eq!(numbering("auth.Authorization"), "auth.Authorization");
    }

    #[test]
    fn display_keeps_angle_form() {
        let ty: Type = "vector<%Message>".parse().unwrap();
        assert_eq!(ty.to_string(), "vector<%Message>");
        assert!(ty.is_vector());
        assert!(ty.generic_arg.unwrap().percent);
    }

    #[test]
    fn unclosed_generic() {
        assert_eq!("Vector<long".parse::<Type>(), Err(ParamParseError::InvalidGeneric));
    }
}
