//! Authoritative id → line mapping for one entity.

use crate::channel::text_block;
use crate::groups::GroupIndex;
use crate::types::{Columns, Line};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
struct Inner {
    lines: BTreeMap<String, Line>,
    groups: GroupIndex,
}

impl Inner {
    fn put(&mut self, line: Line) -> Option<Line> {
        self.groups.insert(&line.id, &line.group_values);
        self.lines.insert(line.id.clone(), line)
    }

    fn remove(&mut self, id: &str) -> Option<Line> {
        self.groups.remove(id);
        self.lines.remove(id)
    }
}

/// Lines of one entity ordered by id, with a group index over them.
///
/// Access is synchronized per entity so single-id reads and writes proceed
/// while a different entity is being rebuilt. The id order only makes
/// rendering deterministic.
pub struct EntityCache {
    entity: String,
    columns: Columns,
    inner: RwLock<Inner>,
}

impl EntityCache {
    pub fn new(entity: impl Into<String>, columns: Columns) -> Self {
        Self {
            entity: entity.into(),
            columns,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn get(&self, id: &str) -> Option<Line> {
        self.inner.read().lines.get(id).cloned()
    }

    /// Store a line under its own id, returning the line it replaced.
    pub fn put(&self, line: Line) -> Option<Line> {
        self.inner.write().put(line)
    }

    /// Returns whether the id was present.
    pub fn remove(&self, id: &str) -> bool {
        self.inner.write().remove(id).is_some()
    }

    /// Apply puts then removals under one write lock, so readers see all
    /// of them or none.
    pub fn apply(&self, updates: Vec<Line>, removes: &BTreeSet<String>) {
        let mut inner = self.inner.write();
        for line in updates {
            inner.put(line);
        }
        for id in removes {
            inner.remove(id);
        }
    }

    /// Replace every line whose `group` value is `key` with `lines`.
    /// Returns the ids that dropped out of the group and were removed.
    pub fn replace_group(&self, group: &str, key: &str, lines: Vec<Line>) -> BTreeSet<String> {
        let mut inner = self.inner.write();
        let mut gone = inner.groups.members(group, key);
        for line in &lines {
            gone.remove(&line.id);
        }
        for id in &gone {
            inner.remove(id);
        }
        for line in lines {
            inner.put(line);
        }
        gone
    }

    /// Ids whose `group` value is currently `key`.
    pub fn group_members(&self, group: &str, key: &str) -> BTreeSet<String> {
        self.inner.read().groups.members(group, key)
    }

    /// Every line, in id order.
    pub fn snapshot_all(&self) -> Vec<Line> {
        self.inner.read().lines.values().cloned().collect()
    }

    /// The lines for `ids` that are present, in id order regardless of the
    /// order requested.
    pub fn snapshot_subset<I, S>(&self, ids: I) -> Vec<Line>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let wanted: BTreeSet<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        let inner = self.inner.read();
        wanted
            .iter()
            .filter_map(|id| inner.lines.get(id).cloned())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().lines.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().lines.is_empty()
    }

    /// The whole entity as a wire payload.
    pub fn render(&self) -> String {
        let inner = self.inner.read();
        text_block::render_payload(&self.columns, inner.lines.values(), std::iter::empty())
    }

    /// A payload of the present lines among `updated` followed by `deleted`.
    pub fn render_subset(&self, updated: &BTreeSet<String>, deleted: &BTreeSet<String>) -> String {
        let lines = self.snapshot_subset(updated);
        text_block::render_payload(&self.columns, &lines, deleted)
    }
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("entity", &self.entity)
            .field("columns", &self.columns)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> EntityCache {
        EntityCache::new("customer", Columns::parse("id,name,currency").unwrap())
    }

    fn line(id: &str, name: &str, currency: &str) -> Line {
        Line::from_fields([Some(id), Some(name), Some(currency)])
            .unwrap()
            .with_group("currency", currency)
    }

    #[test]
    fn test_put_get_remove() {
        let cache = cache();
        assert!(cache.put(line("1", "Alice", "GBP")).is_none());
        let previous = cache.put(line("1", "Alicia", "GBP")).unwrap();
        assert_eq!(previous.row, "1,Alice,GBP");
        assert_eq!(cache.get("1").unwrap().row, "1,Alicia,GBP");

        assert!(cache.remove("1"));
        assert!(!cache.remove("1"));
        assert!(cache.get("1").is_none());
    }

    #[test]
    fn test_snapshot_subset_keeps_id_order() {
        let cache = cache();
        for id in ["3", "1", "2"] {
            cache.put(line(id, "x", "GBP"));
        }
        let ids: Vec<String> = cache
            .snapshot_subset(["3", "9", "1"])
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(cache.snapshot_all().len(), 3);
    }

    #[test]
    fn test_replace_group() {
        let cache = cache();
        cache.put(line("1", "Alice", "GBP"));
        cache.put(line("2", "Bob", "GBP"));
        cache.put(line("3", "Carol", "EUR"));

        let gone = cache.replace_group("currency", "GBP", vec![line("2", "Bobby", "GBP")]);

        assert_eq!(gone.into_iter().collect::<Vec<_>>(), vec!["1"]);
        assert!(cache.get("1").is_none());
        assert_eq!(cache.get("2").unwrap().row, "2,Bobby,GBP");
        assert!(cache.get("3").is_some());
        assert_eq!(cache.group_members("currency", "GBP").len(), 1);
    }

    #[test]
    fn test_render() {
        let cache = cache();
        cache.put(line("2", "Bob", "EUR"));
        cache.put(line("1", "Alice", "GBP"));
        assert_eq!(cache.render(), "id,name,currency\n1,Alice,GBP\n2,Bob,EUR");

        let updated = ["1".to_string()].into_iter().collect();
        let deleted = ["7".to_string()].into_iter().collect();
        assert_eq!(
            cache.render_subset(&updated, &deleted),
            "id,name,currency\n1,Alice,GBP\n7"
        );
    }
}
