//! Conversion of lines into typed records.

use crate::error::{CacheError, Result};
use crate::types::{Columns, Line};
use parking_lot::RwLock;
use serde::de::value::{Error as ValueError, MapDeserializer};
use serde::de::{self, DeserializeOwned, IntoDeserializer, Visitor};
use serde::forward_to_deserialize_any;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;

/// Turns one line into a typed record.
pub trait RecordConverter<T>: Send + Sync {
    fn convert(&self, columns: &Columns, line: &Line) -> Result<T>;
}

impl<T, F> RecordConverter<T> for F
where
    F: Fn(&Columns, &Line) -> Result<T> + Send + Sync,
{
    fn convert(&self, columns: &Columns, line: &Line) -> Result<T> {
        self(columns, line)
    }
}

fn conversion_error(line: &Line, reason: impl Display) -> CacheError {
    CacheError::Conversion {
        entity: String::new(),
        id: line.id.clone(),
        reason: reason.to_string(),
    }
}

type Setter<T> = Box<dyn Fn(&mut T, Option<&str>) -> std::result::Result<(), String> + Send + Sync>;

/// Column positions resolved against one column list.
struct Plan {
    columns: Columns,
    /// Setter index per column position; `None` for ignored columns.
    setters: Vec<Option<usize>>,
}

/// A typed table of column name to field setter.
///
/// The columns an origin sends must match the table exactly: every column
/// has a setter or is explicitly ignored, and every setter has a column.
/// This is checked once per column list, before any record is built.
///
/// ```ignore
/// let table = FieldTable::<Customer>::new()
///     .required("id", |c, v: String| c.id = v)
///     .optional("name", |c, v: Option<String>| c.name = v)
///     .ignore("audit_stamp");
/// ```
pub struct FieldTable<T> {
    names: Vec<String>,
    setters: Vec<Setter<T>>,
    ignored: BTreeSet<String>,
    plan: RwLock<Option<Plan>>,
}

impl<T: Default + 'static> FieldTable<T> {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            setters: Vec::new(),
            ignored: BTreeSet::new(),
            plan: RwLock::new(None),
        }
    }

    /// Bind a column to a raw setter.
    pub fn field<F>(mut self, column: impl Into<String>, setter: F) -> Self
    where
        F: Fn(&mut T, Option<&str>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.names.push(column.into());
        self.setters.push(Box::new(setter));
        self
    }

    /// Bind a column that must not be null, parsed with `FromStr`.
    pub fn required<V, F>(self, column: impl Into<String>, assign: F) -> Self
    where
        V: FromStr + 'static,
        V::Err: Display,
        F: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let column = column.into();
        let name = column.clone();
        self.field(column, move |record, value| {
            let value = value.ok_or_else(|| format!("{} is null", name))?;
            let parsed = value
                .parse::<V>()
                .map_err(|e| format!("{} = {:?}: {}", name, value, e))?;
            assign(record, parsed);
            Ok(())
        })
    }

    /// Bind a nullable column, parsed with `FromStr`.
    pub fn optional<V, F>(self, column: impl Into<String>, assign: F) -> Self
    where
        V: FromStr + 'static,
        V::Err: Display,
        F: Fn(&mut T, Option<V>) + Send + Sync + 'static,
    {
        let column = column.into();
        let name = column.clone();
        self.field(column, move |record, value| {
            let parsed = match value {
                Some(v) => Some(
                    v.parse::<V>()
                        .map_err(|e| format!("{} = {:?}: {}", name, v, e))?,
                ),
                None => None,
            };
            assign(record, parsed);
            Ok(())
        })
    }

    /// Accept a column without binding it.
    pub fn ignore(mut self, column: impl Into<String>) -> Self {
        self.ignored.insert(column.into());
        self
    }

    /// Check that `columns` and the bound names correspond one to one.
    pub fn validate(&self, columns: &Columns) -> Result<()> {
        let bound: BTreeSet<&str> = self.names.iter().map(String::as_str).collect();
        if bound.len() != self.names.len() {
            return Err(CacheError::Encoding(format!(
                "column bound twice in field table: {:?}",
                self.names
            )));
        }

        let unbound: Vec<&str> = columns
            .names()
            .iter()
            .map(String::as_str)
            .filter(|c| !bound.contains(c) && !self.ignored.contains(*c))
            .collect();
        let missing: Vec<&str> = self
            .names
            .iter()
            .map(String::as_str)
            .filter(|n| columns.position(n).is_none())
            .collect();

        if unbound.is_empty() && missing.is_empty() {
            Ok(())
        } else {
            Err(CacheError::Encoding(format!(
                "columns {} do not match fields: unbound columns {:?}, fields without a column {:?}",
                columns, unbound, missing
            )))
        }
    }

    fn plan_for(&self, columns: &Columns) -> Result<Vec<Option<usize>>> {
        if let Some(plan) = self.plan.read().as_ref() {
            if &plan.columns == columns {
                return Ok(plan.setters.clone());
            }
        }

        self.validate(columns)?;
        let setters: Vec<Option<usize>> = columns
            .names()
            .iter()
            .map(|c| self.names.iter().position(|n| n == c))
            .collect();
        *self.plan.write() = Some(Plan {
            columns: columns.clone(),
            setters: setters.clone(),
        });
        Ok(setters)
    }
}

impl<T: Default + 'static> Default for FieldTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + Send + Sync + 'static> RecordConverter<T> for FieldTable<T> {
    fn convert(&self, columns: &Columns, line: &Line) -> Result<T> {
        let plan = self.plan_for(columns)?;
        let fields = line.fields()?;
        if fields.len() != plan.len() {
            return Err(conversion_error(
                line,
                format!("{} fields for {} columns", fields.len(), plan.len()),
            ));
        }

        let mut record = T::default();
        for (field, setter) in fields.iter().zip(plan) {
            if let Some(index) = setter {
                (self.setters[index])(&mut record, field.as_deref())
                    .map_err(|reason| conversion_error(line, reason))?;
            }
        }
        Ok(record)
    }
}

/// Builds records through their `serde::Deserialize` implementation,
/// presenting each line as a map of column name to field.
///
/// Renames, defaults and `deny_unknown_fields` declared on the record type
/// govern the binding. Null fields read as `None`; other fields are parsed
/// from text into the type each field asks for.
pub struct SerdeConverter<T> {
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> SerdeConverter<T> {
    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Default for SerdeConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> RecordConverter<T> for SerdeConverter<T> {
    fn convert(&self, columns: &Columns, line: &Line) -> Result<T> {
        let fields = line.fields()?;
        if fields.len() != columns.len() {
            return Err(conversion_error(
                line,
                format!("{} fields for {} columns", fields.len(), columns.len()),
            ));
        }

        let entries = columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(fields.iter().map(|f| FieldDeserializer(f.as_deref())));
        let map = MapDeserializer::<_, ValueError>::new(entries);
        T::deserialize(map).map_err(|e| conversion_error(line, e))
    }
}

/// One field of a line, parsed on demand into whatever type is asked for.
struct FieldDeserializer<'a>(Option<&'a str>);

impl<'a> FieldDeserializer<'a> {
    fn text(&self) -> std::result::Result<&'a str, ValueError> {
        self.0
            .ok_or_else(|| de::Error::custom("null value for a non-optional field"))
    }

    fn parse<V>(&self) -> std::result::Result<V, ValueError>
    where
        V: FromStr,
        V::Err: Display,
    {
        let text = self.text()?;
        text.parse()
            .map_err(|e| de::Error::custom(format!("{:?}: {}", text, e)))
    }
}

macro_rules! deserialize_parsed {
    ($($method:ident => $visit:ident : $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, ValueError> {
                visitor.$visit(self.parse::<$ty>()?)
            }
        )*
    };
}

impl<'de, 'a> de::Deserializer<'de> for FieldDeserializer<'a> {
    type Error = ValueError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, ValueError> {
        match self.0 {
            Some(text) => visitor.visit_str(text),
            None => visitor.visit_none(),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, ValueError> {
        match self.0 {
            Some(_) => visitor.visit_some(self),
            None => visitor.visit_none(),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, ValueError> {
        visitor.visit_str(self.text()?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, ValueError> {
        visitor.visit_string(self.text()?.to_string())
    }

    deserialize_parsed! {
        deserialize_bool => visit_bool: bool,
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
        deserialize_char => visit_char: char,
    }

    forward_to_deserialize_any! {
        i128 u128 bytes byte_buf unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

impl<'de, 'a> IntoDeserializer<'de, ValueError> for FieldDeserializer<'a> {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}
