//! Delimited-record codec for rows and wire payloads.
//!
//! Field rules:
//! - null is written as nothing between delimiters: `a,,c`
//! - the empty string is always quoted: `a,"",c`
//! - values containing a comma, quote or line break are quoted, with
//!   internal quotes doubled
//!
//! Parsing is the exact inverse, so a row rendered here and split again
//! yields the same `Option<String>` fields.

use crate::error::{CacheError, Result};

/// Field delimiter.
pub const DELIMITER: char = ',';

/// Quote character.
pub const QUOTE: char = '"';

/// Rendering of the empty string.
pub const EMPTY_STRING: &str = "\"\"";

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|c| matches!(c, DELIMITER | QUOTE | '\n' | '\r'))
}

/// Append one escaped field to `out`.
pub fn escape_field(out: &mut String, value: Option<&str>) {
    let value = match value {
        Some(v) => v,
        None => return,
    };

    if value.is_empty() {
        out.push_str(EMPTY_STRING);
    } else if needs_quoting(value) {
        out.push(QUOTE);
        for c in value.chars() {
            if c == QUOTE {
                out.push(QUOTE);
            }
            out.push(c);
        }
        out.push(QUOTE);
    } else {
        out.push_str(value);
    }
}

/// Render a sequence of fields as one delimited row.
pub fn render_row<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut row = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            row.push(DELIMITER);
        }
        escape_field(&mut row, field);
    }
    row
}

/// Split one row into its fields.
///
/// The row must hold exactly one record; an embedded line break is only
/// legal inside a quoted field.
pub fn split_row(row: &str) -> Result<Vec<Option<String>>> {
    let (fields, next) = parse_record(row, 0)?;
    if next < row.len() {
        return Err(CacheError::Encoding(format!(
            "row holds more than one record: {:?}",
            row
        )));
    }
    Ok(fields)
}

/// Iterator over the records of a multi-line text block.
///
/// Accepts `\n` and `\r\n` terminators and skips blank lines.
pub struct RecordReader<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Result<Vec<Option<String>>>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && matches!(bytes[self.pos], b'\n' | b'\r') {
            self.pos += 1;
        }
        if self.pos >= bytes.len() {
            return None;
        }

        match parse_record(self.text, self.pos) {
            Ok((fields, next)) => {
                self.pos = next;
                Some(Ok(fields))
            }
            Err(e) => {
                self.pos = self.text.len();
                Some(Err(e))
            }
        }
    }
}

/// Parse the record starting at byte `start`. Returns the fields and the
/// position just past the record terminator.
fn parse_record(text: &str, start: usize) -> Result<(Vec<Option<String>>, usize)> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut fields = Vec::new();
    let mut pos = start;

    loop {
        if pos < len && bytes[pos] == b'"' {
            let mut value = String::new();
            let mut i = pos + 1;
            loop {
                let quote = match text[i..].find(QUOTE) {
                    Some(offset) => i + offset,
                    None => {
                        return Err(CacheError::Encoding(format!(
                            "unterminated quoted field starting at byte {}",
                            pos
                        )))
                    }
                };
                value.push_str(&text[i..quote]);
                if quote + 1 < len && bytes[quote + 1] == b'"' {
                    value.push(QUOTE);
                    i = quote + 2;
                } else {
                    pos = quote + 1;
                    break;
                }
            }
            fields.push(Some(value));
        } else {
            let end = text[pos..]
                .find(|c: char| matches!(c, DELIMITER | '\n' | '\r'))
                .map(|offset| pos + offset)
                .unwrap_or(len);
            let raw = &text[pos..end];
            if raw.contains(QUOTE) {
                return Err(CacheError::Encoding(format!(
                    "unexpected quote in unquoted field: {:?}",
                    raw
                )));
            }
            fields.push(if raw.is_empty() {
                None
            } else {
                Some(raw.to_string())
            });
            pos = end;
        }

        if pos >= len {
            return Ok((fields, len));
        }

        match bytes[pos] {
            b',' => pos += 1,
            b'\n' => return Ok((fields, pos + 1)),
            b'\r' => {
                pos += 1;
                if pos < len && bytes[pos] == b'\n' {
                    pos += 1;
                }
                return Ok((fields, pos));
            }
            _ => {
                return Err(CacheError::Encoding(format!(
                    "unexpected character after quoted field at byte {}",
                    pos
                )))
            }
        }
    }
}
