//! Line-oriented driver behind [`crate::parse_tl_file`].

use std::str::FromStr;

use crate::errors::ParseError;
use crate::tl::{Category, Definition};

pub(crate) struct TlIterator<'a> {
    lines: std::str::Lines<'a>,
    category: Category,
    /// Text of a definition that has not seen its `;` yet.
    pending: String,
}

impl<'a> TlIterator<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Self { lines: src.lines(), category: Category::Types, pending: String::new() }
    }

    fn switch_section(&mut self, line: &str) -> bool {
        match line {
            "---functions---" => self.category = Category::Functions,
            "---types---" => self.category = Category::Types,
            _ => return false,
        }
        true
    }
}

/// Strip a trailing `// comment` from a definition line.
fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(at) => line[..at].trim_end(),
        None => line,
    }
}

impl Iterator for TlIterator<'_> {
    type Item = Result<Definition, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(line) = self.lines.next() else {
                // A trailing definition without `;` is still a definition.
                let raw = std::mem::take(&mut self.pending);
                let raw = raw.trim();
                if raw.is_empty() {
                    return None;
                }
                return Some(self.finish(raw));
            };

            let trimmed = strip_comment(line.trim());
            if trimmed.is_empty() || self.switch_section(trimmed) {
                continue;
            }

            self.pending.push(' ');
            self.pending.push_str(trimmed);
            if !trimmed.ends_with(';') {
                continue;
            }

            let raw = std::mem::take(&mut self.pending);
            let raw = raw.trim().trim_end_matches(';').trim();
            if raw.is_empty() {
                continue;
            }
            return Some(self.finish(raw));
        }
    }
}

impl TlIterator<'_> {
    fn finish(&self, raw: &str) -> Result<Definition, ParseError> {
        let category = self.category;
        Definition::from_str(raw).map(|mut d| {
            d.category = category;
            d
        })
    }
}
