//! Configuration for both caching tiers.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How `apply_trusted_transaction` treats rows supplied by the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Apply the rows as given. They are still diffed against the cache.
    #[default]
    Trusted,
    /// Ignore the row content and re-fetch the ids from the origin.
    Untrusted,
    /// Re-fetch, warn about every row that disagrees with the origin, and
    /// publish the origin's value.
    Reconcile,
}

/// Configuration for an origin cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Groups each entity may be partially reloaded by.
    pub groups: BTreeMap<String, Vec<String>>,

    pub update_mode: UpdateMode,

    /// Capacity of queues created by `OriginCache::outbound_channel`.
    pub outbound_buffer: usize,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
            update_mode: UpdateMode::Trusted,
            outbound_buffer: 1024,
        }
    }
}

impl OriginConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.outbound_buffer == 0 {
            return Err(CacheError::Config("outbound_buffer must be positive".into()));
        }
        for (entity, groups) in &self.groups {
            if groups.iter().any(|g| g.is_empty()) {
                return Err(CacheError::Config(format!(
                    "empty group name declared for {}",
                    entity
                )));
            }
        }
        Ok(())
    }

    /// Declare a group for an entity.
    pub fn with_group(mut self, entity: impl Into<String>, group: impl Into<String>) -> Self {
        self.groups.entry(entity.into()).or_default().push(group.into());
        self
    }

    pub fn declares_group(&self, entity: &str, group: &str) -> bool {
        self.groups
            .get(entity)
            .map_or(false, |groups| groups.iter().any(|g| g == group))
    }
}

/// Configuration for a consumer cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// The entity this cache holds.
    pub entity: String,

    /// How long `wait_until_loaded` waits by default.
    pub load_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            entity: String::new(),
            load_timeout_ms: 30_000,
        }
    }
}

impl ConsumerConfig {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Default::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        if config.entity.is_empty() {
            return Err(CacheError::Config("consumer entity must be set".into()));
        }
        Ok(config)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_config_from_json() {
        let config = OriginConfig::from_json(
            r#"{"groups": {"customer": ["currency"]}, "update_mode": "reconcile"}"#,
        )
        .unwrap();
        assert_eq!(config.update_mode, UpdateMode::Reconcile);
        assert!(config.declares_group("customer", "currency"));
        assert!(!config.declares_group("customer", "region"));
        assert_eq!(config.outbound_buffer, 1024);
    }

    #[test]
    fn test_origin_config_rejects_zero_buffer() {
        assert!(matches!(
            OriginConfig::from_json(r#"{"outbound_buffer": 0}"#),
            Err(CacheError::Config(_))
        ));
        assert!(OriginConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_consumer_config() {
        let config = ConsumerConfig::from_json(r#"{"entity": "customer", "load_timeout_ms": 50}"#)
            .unwrap();
        assert_eq!(config.load_timeout(), Duration::from_millis(50));
        assert!(ConsumerConfig::from_json("{}").is_err());
    }
}
