//! Reversible encoding of several string components into one id.
//!
//! Components are joined with `/`. Backslashes are written as `\\` and
//! separators inside a component as `\/`. Null components become empty
//! pieces and empty pieces parse back as null, so `Some("")` normalises to
//! `None`.
//!
//! Backslashes are escaped in every id, not only in ids where some
//! component holds a separator. Ids written by encoders that escape only in
//! that case differ for components holding a backslash and no `/`, and a
//! backslash followed by anything but `\` or `/` is rejected rather than
//! kept literally.

use crate::error::{CacheError, Result};

/// Separator between components.
pub const SEPARATOR: char = '/';

const ESCAPE: char = '\\';

/// Composite id codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompositeIdCodec;

impl CompositeIdCodec {
    /// Join components into one id.
    pub fn create_id(components: &[Option<&str>]) -> String {
        let mut id = String::new();
        for (i, component) in components.iter().enumerate() {
            if i > 0 {
                id.push(SEPARATOR);
            }
            if let Some(component) = component {
                for c in component.chars() {
                    if c == ESCAPE || c == SEPARATOR {
                        id.push(ESCAPE);
                    }
                    id.push(c);
                }
            }
        }
        id
    }

    /// Split an id back into its components.
    pub fn parse_id(id: &str) -> Result<Vec<Option<String>>> {
        let mut components = Vec::new();
        let mut current = String::new();
        let mut chars = id.chars();

        while let Some(c) = chars.next() {
            match c {
                ESCAPE => match chars.next() {
                    Some(escaped) if escaped == ESCAPE || escaped == SEPARATOR => {
                        current.push(escaped)
                    }
                    Some(other) => {
                        return Err(CacheError::Encoding(format!(
                            "invalid escape sequence \\{} in composite id {:?}",
                            other, id
                        )))
                    }
                    None => {
                        return Err(CacheError::Encoding(format!(
                            "dangling escape at end of composite id {:?}",
                            id
                        )))
                    }
                },
                SEPARATOR => components.push(Self::finish_piece(&mut current)),
                _ => current.push(c),
            }
        }
        components.push(Self::finish_piece(&mut current));

        Ok(components)
    }

    /// Convenience for all-present components.
    pub fn create_id_from<S: AsRef<str>>(components: &[S]) -> String {
        let components: Vec<Option<&str>> =
            components.iter().map(|c| Some(c.as_ref())).collect();
        Self::create_id(&components)
    }

    fn finish_piece(current: &mut String) -> Option<String> {
        if current.is_empty() {
            None
        } else {
            Some(std::mem::take(current))
        }
    }
}
