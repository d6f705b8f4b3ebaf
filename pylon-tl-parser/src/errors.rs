use std::fmt;
use std::num::ParseIntError;

/// Errors produced while parsing a single `name:type` token.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamParseError {
    /// An empty name or type.
    Empty,
    /// A `{X:Type}` generic declaration. Not an error for the caller; it is
    /// how the parameter parser reports the declaration upwards.
    TypeDef {
        /// Name of the generic (`X` in `{X:Type}`).
        name: String,
    },
    /// A `{...}` block that is not `{X:Type}`, or a reference to an
    /// undeclared generic or flags field.
    MissingDef,
    /// A malformed `flags.N?Type` expression.
    InvalidFlag,
    /// An unclosed `<` in a generic argument.
    InvalidGeneric,
    /// A parameter without `:type`.
    NotImplemented,
}

impl fmt::Display for ParamParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty token"),
            Self::TypeDef { name } => write!(f, "generic type definition: {name}"),
            Self::MissingDef => write!(f, "reference to an undeclared generic or flags field"),
            Self::InvalidFlag => write!(f, "invalid flag expression"),
            Self::InvalidGeneric => write!(f, "invalid generic argument (unclosed `<`)"),
            Self::NotImplemented => write!(f, "parameter without `:type` is not supported"),
        }
    }
}

impl std::error::Error for ParamParseError {}

/// Errors produced while parsing a complete TL definition.
#[derive(Clone, Debug, PartialEq)]
pub enum ParseError {
    /// The input was blank.
    Empty,
    /// No `= Type` was found.
    MissingType,
    /// The name before the parameters was missing or malformed.
    MissingName,
    /// The `#id` hex literal could not be parsed.
    InvalidId(ParseIntError),
    /// A parameter was invalid.
    InvalidParam {
        /// The offending token.
        token: String,
        /// What was wrong with it.
        error: ParamParseError,
    },
    /// Syntax this parser does not support.
    NotImplemented,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty definition"),
            Self::MissingType => write!(f, "missing `= Type`"),
            Self::MissingName => write!(f, "missing or malformed name"),
            Self::InvalidId(e) => write!(f, "invalid constructor id: {e}"),
            Self::InvalidParam { token, error } => write!(f, "invalid parameter `{token}`: {error}"),
            Self::NotImplemented => write!(f, "unsupported TL syntax"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidId(e) => Some(e),
            Self::InvalidParam { error, .. } => Some(error),
            _ => None,
        }
    }
}
