//! Core types shared by both caching tiers.

use crate::codec;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Name of the mandatory first column.
pub const ID_COLUMN: &str = "id";

/// One row of one entity, keyed by its id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    /// Unescaped id, equal to the first field of `row`.
    pub id: String,

    /// The escaped delimited record, id first.
    pub row: String,

    /// Group name to group value, for entities declaring groups.
    #[serde(default)]
    pub group_values: BTreeMap<String, String>,
}

impl Line {
    /// Create a line from an id and an already-escaped row.
    pub fn new(id: impl Into<String>, row: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            row: row.into(),
            group_values: BTreeMap::new(),
        }
    }

    /// Parse the id out of an escaped row.
    pub fn from_row(row: impl Into<String>) -> Result<Self> {
        let row = row.into();
        let fields = codec::split_row(&row)?;
        match fields.into_iter().next().flatten() {
            Some(id) => Ok(Self::new(id, row)),
            None => Err(CacheError::Encoding(format!("row has a null id: {:?}", row))),
        }
    }

    /// Render raw field values into a line. The first field is the id.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let fields: Vec<Option<&str>> = fields.into_iter().collect();
        let id = match fields.first() {
            Some(Some(id)) => id.to_string(),
            _ => return Err(CacheError::Encoding("line requires a non-null id".into())),
        };
        Ok(Self::new(id, codec::render_row(fields)))
    }

    /// Attach a group value.
    pub fn with_group(mut self, group: impl Into<String>, value: impl Into<String>) -> Self {
        self.group_values.insert(group.into(), value.into());
        self
    }

    /// Split the row back into field values.
    pub fn fields(&self) -> Result<Vec<Option<String>>> {
        codec::split_row(&self.row)
    }
}

/// Ordered column list of an entity. The first column is always `id`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Columns(Vec<String>);

impl Columns {
    /// Build from column names, validating the `id`-first rule.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        match names.first() {
            Some(first) if first == ID_COLUMN => {}
            _ => {
                return Err(CacheError::InvalidColumns(format!(
                    "{} must be the first column: {:?}",
                    ID_COLUMN, names
                )))
            }
        }
        if names.iter().any(|n| n.is_empty()) {
            return Err(CacheError::InvalidColumns(format!(
                "empty column name in {:?}",
                names
            )));
        }
        let distinct: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        if distinct.len() != names.len() {
            return Err(CacheError::InvalidColumns(format!(
                "duplicate column name in {:?}",
                names
            )));
        }
        Ok(Self(names))
    }

    /// Parse a header line such as `id,name,currency`.
    pub fn parse(header: &str) -> Result<Self> {
        Self::from_header(codec::split_row(header)?)
    }

    /// Build from the already-split fields of a header record.
    pub(crate) fn from_header(fields: Vec<Option<String>>) -> Result<Self> {
        let mut names = Vec::with_capacity(fields.len());
        for field in fields {
            match field {
                Some(name) => names.push(name),
                None => {
                    return Err(CacheError::InvalidColumns(
                        "null column name in header".into(),
                    ))
                }
            }
        }
        Self::new(names)
    }

    /// Render as a header line.
    pub fn to_csv(&self) -> String {
        codec::render_row(self.0.iter().map(|n| Some(n.as_str())))
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Position of a column.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }
}

impl fmt::Debug for Columns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Columns({})", self.to_csv())
    }
}

impl fmt::Display for Columns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_csv())
    }
}

/// Which entities a subscriber wants to hear about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Interest {
    All,
    Entities(BTreeSet<String>),
}

impl Interest {
    /// Interest in a single entity.
    pub fn entity(name: impl Into<String>) -> Self {
        Interest::Entities(std::iter::once(name.into()).collect())
    }

    /// Interest in a set of entities.
    pub fn entities<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Interest::Entities(names.into_iter().map(Into::into).collect())
    }

    pub fn covers(&self, entity: &str) -> bool {
        match self {
            Interest::All => true,
            Interest::Entities(names) => names.contains(entity),
        }
    }
}

/// Unique identifier for a multiplexer subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

/// Unique identifier for a consumer-cache observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Outcome of comparing fetched lines against the cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Ids whose row changed or appeared.
    pub updated_ids: BTreeSet<String>,
    /// Ids that were cached and are gone from the origin.
    pub deleted_ids: BTreeSet<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.updated_ids.is_empty() && self.deleted_ids.is_empty()
    }
}
