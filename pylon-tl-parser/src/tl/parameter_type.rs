use std::fmt;
use std::str::FromStr;

use crate::errors::ParamParseError;
use crate::tl::{Flag, Type};

/// The type side of a `name:type` parameter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParameterType {
    /// `#`: a 32-bit flags word computed from the conditional fields.
    Flags,

    /// Any other type, optionally guarded by a flag bit.
    Normal {
        /// The declared type.
        ty: Type,
        /// Present only when the bit is set.
        flag: Option<Flag>,
    },
}

impl ParameterType {
    /// Appends the numbering form (see [`Type::write_numbering`]).
    pub fn write_numbering(&self, out: &mut String) {
        match self {
            Self::Flags => out.push('#'),
            Self::Normal { ty, flag } => {
                if let Some(fl) = flag {
                    out.push_str(&format!("{}.{}?", fl.name, fl.index));
                }
                ty.write_numbering(out);
            }
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flags => write!(f, "#"),
            Self::Normal { ty, flag } => {
                if let Some(fl) = flag {
                    write!(f, "{}.{}?", fl.name, fl.index)?;
                }
                write!(f, "{ty}")
            }
        }
    }
}

impl FromStr for ParameterType {
    type Err = ParamParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "#" {
            return Ok(Self::Flags);
        }

        let Some((flag_part, ty_part)) = s.split_once('?') else {
            return Ok(Self::Normal { ty: s.parse()?, flag: None });
        };

        let (name, idx) = flag_part.split_once('.').ok_or(ParamParseError::InvalidFlag)?;
        if name.is_empty() || ty_part.contains('?') {
            return Err(ParamParseError::InvalidFlag);
        }
        let index = idx.parse::<u32>().map_err(|_| ParamParseError::InvalidFlag)?;
        if index > 31 {
            return Err(ParamParseError::InvalidFlag);
        }

        Ok(Self::Normal {
            ty: ty_part.parse()?,
            flag: Some(Flag { name: name.to_owned(), index }),
        })
    }
}
