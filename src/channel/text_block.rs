//! Wire payloads: a header line of column names followed by one record per
//! line. A record holding only an id denotes the deletion of that id.
//!
//! An entity whose only column is `id` therefore cannot carry updates in
//! this format; every record of such a payload reads as a removal.

use crate::codec::{self, RecordReader};
use crate::error::{CacheError, Result};
use crate::types::{Columns, Line};

use super::callback::ChangeChannel;

/// One record of a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Update(Line),
    Remove(String),
}

/// A parsed wire payload. Records keep the order they were written in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub columns: Columns,
    pub records: Vec<Record>,
}

impl Payload {
    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.records.iter().filter_map(|record| match record {
            Record::Update(line) => Some(line),
            Record::Remove(_) => None,
        })
    }

    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.records.iter().filter_map(|record| match record {
            Record::Remove(id) => Some(id.as_str()),
            Record::Update(_) => None,
        })
    }

    /// Drive `sink` with this payload's events for `entity`, in record order.
    pub fn present(&self, entity: &str, sink: &dyn ChangeChannel, bulk: bool) -> Result<()> {
        if bulk {
            sink.start_bulk(entity, &self.columns)?;
        }
        sink.start_block(entity, &self.columns)?;
        for record in &self.records {
            match record {
                Record::Update(line) => sink.process_update(entity, &self.columns, line)?,
                Record::Remove(id) => sink.process_remove(entity, id)?,
            }
        }
        Ok(())
    }
}

/// Render the header, the updated lines and then the deleted ids.
pub fn render_payload<'a, L, D>(columns: &Columns, lines: L, deleted: D) -> String
where
    L: IntoIterator<Item = &'a Line>,
    D: IntoIterator<Item = &'a String>,
{
    let mut out = columns.to_csv();
    for line in lines {
        out.push('\n');
        out.push_str(&line.row);
    }
    for id in deleted {
        out.push('\n');
        codec::escape_field(&mut out, Some(id));
    }
    out
}

/// Parse a payload into its columns and its update and removal records.
pub fn parse_payload(text: &str) -> Result<Payload> {
    let mut reader = RecordReader::new(text);
    let columns = match reader.next() {
        Some(header) => Columns::from_header(header?)?,
        None => return Err(CacheError::Encoding("payload has no header line".into())),
    };

    let mut records = Vec::new();
    for record in reader {
        let fields = record?;
        let id = match fields.first() {
            Some(Some(id)) => id.clone(),
            _ => return Err(CacheError::Encoding("record with a null id".into())),
        };
        if fields.len() == 1 {
            records.push(Record::Remove(id));
        } else if fields.len() == columns.len() {
            let row = codec::render_row(fields.iter().map(|f| f.as_deref()));
            records.push(Record::Update(Line::new(id, row)));
        } else {
            return Err(CacheError::Encoding(format!(
                "record {:?} has {} fields, header has {}",
                id,
                fields.len(),
                columns.len()
            )));
        }
    }

    Ok(Payload { columns, records })
}

/// Drive `sink` with the events of one payload. Does not call `start`,
/// `finish` or `cancel`; the caller brackets the transaction.
pub fn present_block(
    entity: &str,
    text: &str,
    sink: &dyn ChangeChannel,
    bulk: bool,
) -> Result<()> {
    parse_payload(text)?.present(entity, sink, bulk)
}

/// Ids named by a payload, whether as updates or removals.
///
/// Used for id-only update messages, whose rows are not trusted.
pub fn read_ids(text: &str) -> Result<Vec<String>> {
    let mut records = RecordReader::new(text);
    if let Some(header) = records.next() {
        Columns::from_header(header?)?;
    }
    let mut ids = Vec::new();
    for record in records {
        match record?.into_iter().next().flatten() {
            Some(id) => ids.push(id),
            None => return Err(CacheError::Encoding("record with a null id".into())),
        }
    }
    Ok(ids)
}
