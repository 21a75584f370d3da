//! Suppression of no-op updates.
//!
//! Fetched lines are compared against the cached rows by string equality.
//! Every fetched line is written back, but only changed or new ids are
//! reported. A requested id with no fetched line is a deletion, reported
//! only when the cache held it.

use crate::types::{DiffResult, Line};
use std::collections::BTreeSet;
use tracing::debug;

use super::entity_cache::EntityCache;

/// Writes to apply to the cache, and what to announce about them.
#[derive(Clone, Debug, Default)]
pub struct Delta {
    /// Every fetched line, changed or not.
    pub writes: Vec<Line>,
    pub result: DiffResult,
}

impl Delta {
    /// Fetched lines whose ids are reported as updated.
    pub fn changed_lines(&self) -> impl Iterator<Item = &Line> {
        self.writes
            .iter()
            .filter(move |line| self.result.updated_ids.contains(&line.id))
    }

    pub fn is_empty(&self) -> bool {
        self.result.is_empty()
    }
}

/// Compare `fetched` against `cache` for the `requested` ids.
///
/// Fetched lines for ids outside `requested` are treated as requested.
pub fn diff_lines(cache: &EntityCache, requested: &BTreeSet<String>, fetched: Vec<Line>) -> Delta {
    let mut result = DiffResult::default();
    let mut seen = BTreeSet::new();

    for line in &fetched {
        seen.insert(line.id.clone());
        match cache.get(&line.id) {
            Some(cached) if cached.row == line.row => {
                debug!("Suppressing unchanged {}/{}", cache.entity(), line.id);
            }
            _ => {
                result.updated_ids.insert(line.id.clone());
            }
        }
    }

    for id in requested.difference(&seen) {
        if cache.get(id).is_some() {
            result.deleted_ids.insert(id.clone());
        }
    }

    Delta {
        writes: fetched,
        result,
    }
}

/// Forced republish of one id: reported whatever the cached row is.
pub fn poke(cache: &EntityCache, id: &str, fetched: Option<Line>) -> Delta {
    let mut result = DiffResult::default();
    let writes = match fetched {
        Some(line) => {
            result.updated_ids.insert(line.id.clone());
            vec![line]
        }
        None => {
            if cache.get(id).is_some() {
                result.deleted_ids.insert(id.to_string());
            }
            Vec::new()
        }
    };
    Delta { writes, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Columns;

    fn cache_with(rows: &[&str]) -> EntityCache {
        let cache = EntityCache::new("customer", Columns::parse("id,name").unwrap());
        for row in rows {
            cache.put(Line::from_row(*row).unwrap());
        }
        cache
    }

    fn ids(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unchanged_row_is_suppressed() {
        let cache = cache_with(&["1,ABC"]);
        let delta = diff_lines(&cache, &ids(&["1"]), vec![Line::from_row("1,ABC").unwrap()]);
        assert!(delta.is_empty());
        assert_eq!(delta.writes.len(), 1);
    }

    #[test]
    fn test_changed_row_is_reported() {
        let cache = cache_with(&["1,ABC"]);
        let delta = diff_lines(&cache, &ids(&["1"]), vec![Line::from_row("1,XYZ").unwrap()]);
        assert_eq!(delta.result.updated_ids, ids(&["1"]));
        assert_eq!(delta.changed_lines().count(), 1);
    }

    #[test]
    fn test_missing_row_is_deletion_only_if_cached() {
        let cache = cache_with(&["1,ABC"]);
        let delta = diff_lines(&cache, &ids(&["1", "2"]), Vec::new());
        assert_eq!(delta.result.deleted_ids, ids(&["1"]));
        assert!(delta.result.updated_ids.is_empty());
    }

    #[test]
    fn test_poke_always_reports() {
        let cache = cache_with(&["1,ABC"]);
        let delta = poke(&cache, "1", Some(Line::from_row("1,ABC").unwrap()));
        assert_eq!(delta.result.updated_ids, ids(&["1"]));

        let delta = poke(&cache, "1", None);
        assert_eq!(delta.result.deleted_ids, ids(&["1"]));
    }
}
