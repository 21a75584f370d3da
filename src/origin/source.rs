//! The origin-read collaborator and an in-memory implementation of it.

use crate::channel::{text_block, ChangeChannel};
use crate::codec;
use crate::composite_id::CompositeIdCodec;
use crate::error::{CacheError, Result};
use crate::types::{Columns, Line};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Reads the true content of entities.
///
/// Fetches stream into `sink` without calling `start`, `finish` or
/// `cancel`; the caller brackets the transaction.
pub trait OriginSource: Send + Sync {
    /// Every entity this origin serves, in order.
    fn entity_ids(&self) -> Result<BTreeSet<String>>;

    fn column_names(&self, entity: &str) -> Result<Columns>;

    /// Full-bulk marker, then every line of `entity`.
    fn fetch_all(&self, entity: &str, sink: &dyn ChangeChannel) -> Result<()>;

    /// The lines for `ids`. Ids the origin does not hold are sent as removals.
    fn fetch_by_ids(
        &self,
        entity: &str,
        ids: &BTreeSet<String>,
        sink: &dyn ChangeChannel,
    ) -> Result<()>;

    /// Group marker, then every line whose `group` value is `key`.
    fn fetch_by_group(
        &self,
        entity: &str,
        group: &str,
        key: &str,
        sink: &dyn ChangeChannel,
    ) -> Result<()>;
}

struct SourceEntity {
    columns: Columns,
    /// Group name to the position of the column holding its value.
    groups: BTreeMap<String, usize>,
    /// Columns an id is composed from, with their positions. Empty when
    /// the id column is stored as given.
    composite: Vec<(String, usize)>,
    rows: BTreeMap<String, Vec<Option<String>>>,
}

impl SourceEntity {
    /// Overwrite the id field of a composite-id row with the id built from
    /// its components.
    fn derive_id(&self, entity: &str, fields: &mut [Option<String>]) -> Result<String> {
        let mut components = Vec::with_capacity(self.composite.len());
        for (column, position) in &self.composite {
            match fields.get(*position) {
                Some(Some(value)) => components.push(Some(value.as_str())),
                _ => {
                    return Err(CacheError::Encoding(format!(
                        "null value in composite id column {} of {}",
                        column, entity
                    )))
                }
            }
        }
        let id = CompositeIdCodec::create_id(&components);
        fields[0] = Some(id.clone());
        Ok(id)
    }

    /// The storage key for a requested id. Composite ids are split into
    /// their components and rebuilt.
    fn key(&self, entity: &str, id: &str) -> Result<String> {
        if self.composite.is_empty() {
            return Ok(id.to_string());
        }
        let components = CompositeIdCodec::parse_id(id)?;
        if components.len() != self.composite.len() {
            return Err(CacheError::Encoding(format!(
                "{} id {:?} does not have {} components",
                entity,
                id,
                self.composite.len()
            )));
        }
        let borrowed: Vec<Option<&str>> = components.iter().map(|c| c.as_deref()).collect();
        Ok(CompositeIdCodec::create_id(&borrowed))
    }

    /// Re-key every row from its composite-id columns.
    fn rekey(&mut self, entity: &str) -> Result<()> {
        let rows = std::mem::take(&mut self.rows);
        for (_, mut fields) in rows {
            let id = self.derive_id(entity, &mut fields)?;
            if self.rows.insert(id.clone(), fields).is_some() {
                warn!("Duplicate composite id {} in {}; the later row wins", id, entity);
            }
        }
        Ok(())
    }

    fn line(&self, fields: &[Option<String>]) -> Result<Line> {
        let mut line = Line::from_fields(fields.iter().map(|f| f.as_deref()))?;
        for (group, position) in &self.groups {
            if let Some(Some(value)) = fields.get(*position) {
                line.group_values.insert(group.clone(), value.clone());
            }
        }
        Ok(line)
    }
}

/// An origin serving entities held in memory as text blocks.
///
/// Useful for static reference files and for tests. A group is declared
/// over a column; a line's group value is that column's value.
#[derive(Default)]
pub struct TextBlockSource {
    entities: RwLock<BTreeMap<String, SourceEntity>>,
}

impl TextBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the content of `entity` with a wire payload. Removal records
    /// in the payload are ignored.
    pub fn set_block(&self, entity: &str, text: &str) -> Result<()> {
        let payload = text_block::parse_payload(text)?;
        let mut rows = BTreeMap::new();
        for line in payload.lines() {
            rows.insert(line.id.clone(), line.fields()?);
        }

        let mut entities = self.entities.write();
        let (groups, composite) = match entities.get(entity) {
            Some(previous) => (
                previous
                    .groups
                    .keys()
                    .filter_map(|group| {
                        payload.columns.position(group).map(|p| (group.clone(), p))
                    })
                    .collect(),
                previous.composite.clone(),
            ),
            None => (BTreeMap::new(), Vec::new()),
        };
        let mut source = SourceEntity {
            columns: payload.columns,
            groups,
            composite: Vec::new(),
            rows,
        };
        if !composite.is_empty() {
            let names: Vec<&str> = composite.iter().map(|(name, _)| name.as_str()).collect();
            source.composite = Self::composite_positions(entity, &source.columns, &names)?;
            source.rekey(entity)?;
        }
        entities.insert(entity.to_string(), source);
        Ok(())
    }

    /// Build the ids of `entity` from `columns`, in order, instead of
    /// taking them from the id column. Existing rows are re-keyed, and later
    /// lookups split requested ids into their components.
    pub fn declare_composite_id(&self, entity: &str, columns: &[&str]) -> Result<()> {
        let mut entities = self.entities.write();
        let source = entities
            .get_mut(entity)
            .ok_or_else(|| CacheError::UnknownEntity(entity.to_string()))?;
        source.composite = Self::composite_positions(entity, &source.columns, columns)?;
        source.rekey(entity)
    }

    fn composite_positions(
        entity: &str,
        columns: &Columns,
        names: &[&str],
    ) -> Result<Vec<(String, usize)>> {
        if names.is_empty() {
            return Err(CacheError::InvalidColumns(format!(
                "composite id of {} needs at least one column",
                entity
            )));
        }
        names
            .iter()
            .map(|name| match columns.position(name) {
                Some(position) if position > 0 => Ok((name.to_string(), position)),
                _ => Err(CacheError::InvalidColumns(format!(
                    "{} has no column {} to compose ids from",
                    entity, name
                ))),
            })
            .collect()
    }

    /// Declare a group over the column of the same name.
    pub fn declare_group(&self, entity: &str, group: &str) -> Result<()> {
        let mut entities = self.entities.write();
        let source = entities
            .get_mut(entity)
            .ok_or_else(|| CacheError::UnknownEntity(entity.to_string()))?;
        let position = source
            .columns
            .position(group)
            .ok_or_else(|| CacheError::UnknownGroup {
                entity: entity.to_string(),
                group: group.to_string(),
            })?;
        source.groups.insert(group.to_string(), position);
        Ok(())
    }

    /// Insert or replace one row. The first field is the id; for a
    /// composite-id entity it is ignored and derived from the row.
    pub fn upsert(&self, entity: &str, fields: &[Option<&str>]) -> Result<()> {
        let mut entities = self.entities.write();
        let source = entities
            .get_mut(entity)
            .ok_or_else(|| CacheError::UnknownEntity(entity.to_string()))?;
        if fields.len() != source.columns.len() {
            return Err(CacheError::ColumnMismatch {
                entity: entity.to_string(),
                expected: source.columns.to_csv(),
                got: codec::render_row(fields.iter().copied()),
            });
        }
        let mut row: Vec<Option<String>> = fields.iter().map(|f| f.map(str::to_string)).collect();
        let id = if source.composite.is_empty() {
            match fields.first() {
                Some(Some(id)) => id.to_string(),
                _ => return Err(CacheError::Encoding("row requires a non-null id".into())),
            }
        } else {
            source.derive_id(entity, &mut row)?
        };
        source.rows.insert(id, row);
        Ok(())
    }

    /// Returns whether the row existed.
    pub fn delete(&self, entity: &str, id: &str) -> Result<bool> {
        let mut entities = self.entities.write();
        let source = entities
            .get_mut(entity)
            .ok_or_else(|| CacheError::UnknownEntity(entity.to_string()))?;
        let key = source.key(entity, id)?;
        Ok(source.rows.remove(&key).is_some())
    }

    fn with_entity<R>(&self, entity: &str, f: impl FnOnce(&SourceEntity) -> Result<R>) -> Result<R> {
        let entities = self.entities.read();
        let source = entities
            .get(entity)
            .ok_or_else(|| CacheError::UnknownEntity(entity.to_string()))?;
        f(source)
    }
}

impl OriginSource for TextBlockSource {
    fn entity_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.entities.read().keys().cloned().collect())
    }

    fn column_names(&self, entity: &str) -> Result<Columns> {
        self.with_entity(entity, |source| Ok(source.columns.clone()))
    }

    fn fetch_all(&self, entity: &str, sink: &dyn ChangeChannel) -> Result<()> {
        self.with_entity(entity, |source| {
            sink.start_bulk(entity, &source.columns)?;
            sink.start_block(entity, &source.columns)?;
            for fields in source.rows.values() {
                sink.process_update(entity, &source.columns, &source.line(fields)?)?;
            }
            Ok(())
        })
    }

    fn fetch_by_ids(
        &self,
        entity: &str,
        ids: &BTreeSet<String>,
        sink: &dyn ChangeChannel,
    ) -> Result<()> {
        self.with_entity(entity, |source| {
            sink.start_block(entity, &source.columns)?;
            for id in ids {
                match source.rows.get(&source.key(entity, id)?) {
                    Some(fields) => {
                        sink.process_update(entity, &source.columns, &source.line(fields)?)?
                    }
                    None => sink.process_remove(entity, id)?,
                }
            }
            Ok(())
        })
    }

    fn fetch_by_group(
        &self,
        entity: &str,
        group: &str,
        key: &str,
        sink: &dyn ChangeChannel,
    ) -> Result<()> {
        self.with_entity(entity, |source| {
            let position = *source.groups.get(group).ok_or_else(|| CacheError::UnknownGroup {
                entity: entity.to_string(),
                group: group.to_string(),
            })?;
            sink.start_group_bulk(entity, group, key)?;
            sink.start_block(entity, &source.columns)?;
            for fields in source.rows.values() {
                if fields.get(position).and_then(|f| f.as_deref()) == Some(key) {
                    sink.process_update(entity, &source.columns, &source.line(fields)?)?;
                }
            }
            Ok(())
        })
    }
}
