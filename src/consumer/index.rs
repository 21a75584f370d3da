//! Secondary key → id views over a consumer cache.
//!
//! Both index kinds keep the forward map and a reverse id → key map, so a
//! changed or deleted record drops its stale association without scanning.

use crate::error::{CacheError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::warn;

use super::cache::{CacheObserver, ConsumerCache};

/// Projection from a record to its index key. `None` leaves the record out.
pub type Projection<T, K> = Box<dyn Fn(&T) -> Option<K> + Send + Sync>;

/// How to derive an index from records.
pub struct IndexDefinition<T, K> {
    pub name: String,
    /// Whether a key shared by two records at build time is an error.
    pub unique: bool,
    pub project: Projection<T, K>,
}

impl<T, K> IndexDefinition<T, K> {
    pub fn new<F>(name: impl Into<String>, project: F) -> Self
    where
        F: Fn(&T) -> Option<K> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            unique: false,
            project: Box::new(project),
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Sorted ids of a snapshot, so builds are deterministic.
fn sorted<T>(records: &HashMap<String, Arc<T>>) -> Vec<(&String, &Arc<T>)> {
    let mut entries: Vec<_> = records.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

struct UniqueState<K> {
    by_key: HashMap<K, String>,
    by_id: HashMap<String, K>,
}

impl<K: Hash + Eq + Clone> UniqueState<K> {
    fn unlink(&mut self, id: &str) {
        if let Some(key) = self.by_id.remove(id) {
            if self.by_key.get(&key).map(String::as_str) == Some(id) {
                self.by_key.remove(&key);
            }
        }
    }

    /// Returns the id previously holding `key`, if another one did.
    fn link(&mut self, id: &str, key: K) -> Option<String> {
        let displaced = self
            .by_key
            .insert(key.clone(), id.to_string())
            .filter(|previous| previous != id);
        if let Some(previous) = &displaced {
            self.by_id.remove(previous);
        }
        self.by_id.insert(id.to_string(), key);
        displaced
    }
}

/// Key → single id.
pub struct UniqueIndex<T, K> {
    definition: IndexDefinition<T, K>,
    state: RwLock<UniqueState<K>>,
}

impl<T, K> UniqueIndex<T, K>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    /// Build from a snapshot. Fails on a shared key if the definition is
    /// unique; otherwise the later id (in id order) keeps the key.
    pub fn build(
        definition: IndexDefinition<T, K>,
        records: &HashMap<String, Arc<T>>,
    ) -> Result<Self> {
        let mut state = UniqueState {
            by_key: HashMap::new(),
            by_id: HashMap::new(),
        };
        for (id, record) in sorted(records) {
            if let Some(key) = (definition.project)(record) {
                if let Some(previous) = state.link(id, key.clone()) {
                    if definition.unique {
                        return Err(CacheError::DuplicateKey {
                            index: definition.name.clone(),
                            key: format!("{:?} ({} and {})", key, previous, id),
                        });
                    }
                    warn!(
                        "Index {}: key {:?} moved from {} to {}",
                        definition.name, key, previous, id
                    );
                }
            }
        }
        Ok(Self {
            definition,
            state: RwLock::new(state),
        })
    }

    /// Build from the cache's current records and keep in step with it.
    pub fn attach(
        cache: &ConsumerCache<T>,
        definition: IndexDefinition<T, K>,
    ) -> Result<Arc<Self>> {
        let (_, index) =
            cache.add_observer_with(|records| Self::build(definition, records).map(Arc::new))?;
        Ok(index)
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn get(&self, key: &K) -> Option<String> {
        self.state.read().by_key.get(key).cloned()
    }

    pub fn must_get(&self, key: &K) -> Result<String> {
        self.get(key).ok_or_else(|| CacheError::NotFound {
            entity: self.definition.name.clone(),
            id: format!("{:?}", key),
        })
    }

    /// The key `id` is indexed under.
    pub fn key_of(&self, id: &str) -> Option<K> {
        self.state.read().by_id.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().by_key.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.state.read().by_key.keys().cloned().collect()
    }
}

impl<T, K> CacheObserver<T> for UniqueIndex<T, K>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    fn records_updated(&self, updated: &HashMap<String, Arc<T>>) {
        let mut state = self.state.write();
        for (id, _) in sorted(updated) {
            state.unlink(id);
        }
        for (id, record) in sorted(updated) {
            if let Some(key) = (self.definition.project)(record) {
                if let Some(previous) = state.link(id, key.clone()) {
                    warn!(
                        "Index {}: key {:?} moved from {} to {}",
                        self.definition.name, key, previous, id
                    );
                }
            }
        }
    }

    fn records_deleted(&self, deleted: &BTreeSet<String>) {
        let mut state = self.state.write();
        for id in deleted {
            state.unlink(id);
        }
    }
}

struct MultiState<K> {
    by_key: HashMap<K, BTreeSet<String>>,
    by_id: HashMap<String, K>,
}

impl<K: Hash + Eq + Clone> MultiState<K> {
    fn unlink(&mut self, id: &str) {
        if let Some(key) = self.by_id.remove(id) {
            if let Some(ids) = self.by_key.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
    }

    fn link(&mut self, id: &str, key: K) {
        self.by_key
            .entry(key.clone())
            .or_default()
            .insert(id.to_string());
        self.by_id.insert(id.to_string(), key);
    }
}

/// Key → set of ids.
pub struct MultiIndex<T, K> {
    definition: IndexDefinition<T, K>,
    state: RwLock<MultiState<K>>,
}

impl<T, K> MultiIndex<T, K>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    pub fn build(
        definition: IndexDefinition<T, K>,
        records: &HashMap<String, Arc<T>>,
    ) -> Result<Self> {
        let mut state = MultiState {
            by_key: HashMap::new(),
            by_id: HashMap::new(),
        };
        for (id, record) in records {
            if let Some(key) = (definition.project)(record) {
                state.link(id, key);
            }
        }
        Ok(Self {
            definition,
            state: RwLock::new(state),
        })
    }

    pub fn attach(
        cache: &ConsumerCache<T>,
        definition: IndexDefinition<T, K>,
    ) -> Result<Arc<Self>> {
        let (_, index) =
            cache.add_observer_with(|records| Self::build(definition, records).map(Arc::new))?;
        Ok(index)
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Ids under `key`; empty when there are none.
    pub fn get(&self, key: &K) -> BTreeSet<String> {
        self.state
            .read()
            .by_key
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn must_get(&self, key: &K) -> Result<BTreeSet<String>> {
        let ids = self.get(key);
        if ids.is_empty() {
            Err(CacheError::NotFound {
                entity: self.definition.name.clone(),
                id: format!("{:?}", key),
            })
        } else {
            Ok(ids)
        }
    }

    pub fn key_of(&self, id: &str) -> Option<K> {
        self.state.read().by_id.get(id).cloned()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.state.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().by_key.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.state.read().by_key.keys().cloned().collect()
    }
}

impl<T, K> CacheObserver<T> for MultiIndex<T, K>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    fn records_updated(&self, updated: &HashMap<String, Arc<T>>) {
        let mut state = self.state.write();
        for (id, record) in updated {
            state.unlink(id);
            if let Some(key) = (self.definition.project)(record) {
                state.link(id, key);
            }
        }
    }

    fn records_deleted(&self, deleted: &BTreeSet<String>) {
        let mut state = self.state.write();
        for id in deleted {
            state.unlink(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Customer {
        email: Option<String>,
        currency: String,
    }

    fn customer(email: Option<&str>, currency: &str) -> Arc<Customer> {
        Arc::new(Customer {
            email: email.map(str::to_string),
            currency: currency.to_string(),
        })
    }

    fn records(entries: &[(&str, Arc<Customer>)]) -> HashMap<String, Arc<Customer>> {
        entries
            .iter()
            .map(|(id, c)| (id.to_string(), c.clone()))
            .collect()
    }

    fn by_email() -> IndexDefinition<Customer, String> {
        IndexDefinition::new("by_email", |c: &Customer| c.email.clone())
    }

    fn by_currency() -> IndexDefinition<Customer, String> {
        IndexDefinition::new("by_currency", |c: &Customer| Some(c.currency.clone()))
    }

    #[test]
    fn test_unique_build_rejects_duplicates() {
        let snapshot = records(&[
            ("1", customer(Some("a@x"), "GBP")),
            ("2", customer(Some("a@x"), "EUR")),
        ]);
        assert!(matches!(
            UniqueIndex::build(by_email().unique(), &snapshot),
            Err(CacheError::DuplicateKey { .. })
        ));

        let index = UniqueIndex::build(by_email(), &snapshot).unwrap();
        assert_eq!(index.get(&"a@x".to_string()).as_deref(), Some("2"));
    }

    #[test]
    fn test_absent_projection_excludes() {
        let snapshot = records(&[("1", customer(None, "GBP"))]);
        let index = UniqueIndex::build(by_email(), &snapshot).unwrap();
        assert!(index.is_empty());
        assert!(index.key_of("1").is_none());
    }

    #[test]
    fn test_unique_tracks_key_changes() {
        let index = UniqueIndex::build(
            by_email(),
            &records(&[("1", customer(Some("a@x"), "GBP"))]),
        )
        .unwrap();

        index.records_updated(&records(&[("1", customer(Some("b@x"), "GBP"))]));
        assert!(index.get(&"a@x".to_string()).is_none());
        assert_eq!(index.must_get(&"b@x".to_string()).unwrap(), "1");

        index.records_deleted(&["1".to_string()].into_iter().collect());
        assert!(index.is_empty());
    }

    #[test]
    fn test_multi_index_moves_between_keys() {
        let index = MultiIndex::build(
            by_currency(),
            &records(&[
                ("1", customer(None, "GBP")),
                ("2", customer(None, "GBP")),
            ]),
        )
        .unwrap();
        assert_eq!(index.get(&"GBP".to_string()).len(), 2);

        index.records_updated(&records(&[("1", customer(None, "EUR"))]));
        assert_eq!(index.get(&"GBP".to_string()).len(), 1);
        assert!(index.get(&"EUR".to_string()).contains("1"));

        index.records_deleted(&["2".to_string()].into_iter().collect());
        assert!(index.get(&"GBP".to_string()).is_empty());
        assert!(matches!(
            index.must_get(&"GBP".to_string()),
            Err(CacheError::NotFound { .. })
        ));
        assert_eq!(index.keys(), vec!["EUR".to_string()]);
    }
}
