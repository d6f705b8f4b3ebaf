use std::fmt;
use std::str::FromStr;

use crate::errors::ParamParseError;
use crate::tl::ParameterType;

/// A single `name:type` parameter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Parameter {
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: ParameterType,
}

impl Parameter {
    /// Whether this parameter is a `flags.N?true` presence bit.
    pub fn is_true_flag(&self) -> bool {
        matches!(
            &self.ty,
            ParameterType::Normal { ty, flag: Some(_) } if ty.name == "true" && ty.namespace.is_empty()
        )
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.ty)
    }
}

impl FromStr for Parameter {
    type Err = ParamParseError;

    /// Parses `flags:#`, `id:long`, `photo:flags.0?InputPhoto` and so on.
    ///
    /// `{X:Type}` yields `Err(ParamParseError::TypeDef { name })`, which the
    /// definition parser records as a generic declaration.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        if let Some(inner) = token.strip_prefix('{') {
            return Err(match inner.strip_suffix(":Type}") {
                Some(name) if !name.is_empty() => ParamParseError::TypeDef { name: name.into() },
                _ => ParamParseError::MissingDef,
            });
        }

        let (name, ty) = token.split_once(':').ok_or(ParamParseError::NotImplemented)?;
        if name.is_empty() || ty.is_empty() {
            return Err(ParamParseError::Empty);
        }

        Ok(Self { name: name.to_owned(), ty: ty.parse()? })
    }
}
