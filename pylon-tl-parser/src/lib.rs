//! Parser for Telegram's [Type Language] (TL) schema text.
//!
//! Converts `.tl` source into a list of [`Definition`]s. The schema engine in
//! `pylon-tl` turns those into a validated, numbered registry; this crate
//! only deals with syntax.
//!
//! # Quick start
//!
//! ```rust
//! use pylon_tl_parser::parse_tl_file;
//!
//! let src = "pong#347773c5 msg_id:long ping_id:long = Pong;";
//! for def in parse_tl_file(src) {
//!     let def = def.unwrap();
//!     assert_eq!(def.id(), 0x347773c5);
//! }
//! ```
//!
//! [Type Language]: https://core.telegram.org/mtproto/TL

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Parse error types for TL schema parsing.
pub mod errors;
pub mod tl;
mod iterator;
mod utils;

use errors::ParseError;
use tl::Definition;

pub use utils::crc32;

/// Parses a complete TL schema, yielding [`Definition`]s one by one.
///
/// Lines starting with `//` are comments. The `---functions---` and
/// `---types---` markers switch the [`tl::Category`] of what follows.
/// Definitions may span several lines; a `;` terminates each one.
pub fn parse_tl_file(contents: &str) -> impl Iterator<Item = Result<Definition, ParseError>> + '_ {
    iterator::TlIterator::new(contents)
}
