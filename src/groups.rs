//! Group membership index: (group, value) to ids, and id to group values.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Tracks which ids belong to which group value.
#[derive(Clone, Debug, Default)]
pub struct GroupIndex {
    members: HashMap<(String, String), BTreeSet<String>>,
    by_id: HashMap<String, BTreeMap<String, String>>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the group values of `id`, replacing any previous ones.
    pub fn insert(&mut self, id: &str, group_values: &BTreeMap<String, String>) {
        self.remove(id);
        if group_values.is_empty() {
            return;
        }
        for (group, value) in group_values {
            self.members
                .entry((group.clone(), value.clone()))
                .or_default()
                .insert(id.to_string());
        }
        self.by_id.insert(id.to_string(), group_values.clone());
    }

    /// Forget `id`.
    pub fn remove(&mut self, id: &str) {
        if let Some(previous) = self.by_id.remove(id) {
            for (group, value) in previous {
                let key = (group, value);
                if let Some(ids) = self.members.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.members.remove(&key);
                    }
                }
            }
        }
    }

    /// Ids currently holding `value` for `group`.
    pub fn members(&self, group: &str, value: &str) -> BTreeSet<String> {
        self.members
            .get(&(group.to_string(), value.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}
