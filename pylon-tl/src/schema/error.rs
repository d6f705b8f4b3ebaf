use std::fmt;

use pylon_tl_parser::errors::ParseError;

/// Reasons a schema cannot be built. Always a programming error in the
/// declarations, never a runtime condition.
#[derive(Clone, Debug, PartialEq)]
pub enum SchemaError {
    /// TL source could not be parsed.
    Parse { definition: String, error: ParseError },
    /// A combinator declaration is malformed; `field` names the culprit.
    InvalidCombinator { name: String, field: Option<String>, reason: String },
    /// A function declaration is malformed; `param` names the culprit.
    InvalidFunction { name: String, param: Option<String>, reason: String },
    /// Two definitions share a 32-bit id.
    DuplicateId { id: u32, first: String, second: String },
    /// Two combinators (or two functions) share a name.
    DuplicateName { name: String },
}

impl SchemaError {
    pub(crate) fn combinator(name: &str, field: Option<&str>, reason: impl Into<String>) -> Self {
        Self::InvalidCombinator {
            name: name.to_owned(),
            field: field.map(str::to_owned),
            reason: reason.into(),
        }
    }

    pub(crate) fn function(name: &str, param: Option<&str>, reason: impl Into<String>) -> Self {
        Self::InvalidFunction {
            name: name.to_owned(),
            param: param.map(str::to_owned),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { definition, error } => write!(f, "cannot parse `{definition}`: {error}"),
            Self::InvalidCombinator { name, field: Some(field), reason } => {
                write!(f, "invalid combinator `{name}`, field `{field}`: {reason}")
            }
            Self::InvalidCombinator { name, field: None, reason } => {
                write!(f, "invalid combinator `{name}`: {reason}")
            }
            Self::InvalidFunction { name, param: Some(param), reason } => {
                write!(f, "invalid function `{name}`, parameter `{param}`: {reason}")
            }
            Self::InvalidFunction { name, param: None, reason } => {
                write!(f, "invalid function `{name}`: {reason}")
            }
            Self::DuplicateId { id, first, second } => {
                write!(f, "id {id:#010x} is used by both `{first}` and `{second}`")
            }
            Self::DuplicateName { name } => write!(f, "`{name}` is declared twice"),
        }
    }
}

impl std::error::Error for SchemaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse { error, .. } => Some(error),
            _ => None,
        }
    }
}
