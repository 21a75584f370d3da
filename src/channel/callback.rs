//! The change-propagation callback contract.

use crate::error::Result;
use crate::types::{Columns, Line};

/// Callback contract producers use to push transactions.
///
/// Call order per transaction:
///
/// ```text
/// start
///   ( start_bulk | start_group_bulk )?  start_block  ( process_update | process_remove )*
///   ... repeated per touched entity ...
/// finish | cancel
/// ```
///
/// `cancel` may replace `finish` at any point and must restore the state
/// seen before `start`. A transaction with no events is valid.
pub trait ChangeChannel: Send + Sync {
    /// Open a transaction.
    fn start(&self) -> Result<()>;

    /// The following lines are the complete surviving content of `entity`.
    /// The column list may change here and only here.
    fn start_bulk(&self, entity: &str, columns: &Columns) -> Result<()>;

    /// The following lines are the complete surviving content of the rows
    /// whose `group` value is `key`.
    fn start_group_bulk(&self, entity: &str, group: &str, key: &str) -> Result<()>;

    /// Begin the block of events for `entity`.
    fn start_block(&self, entity: &str, columns: &Columns) -> Result<()>;

    fn process_update(&self, entity: &str, columns: &Columns, line: &Line) -> Result<()>;

    fn process_remove(&self, entity: &str, id: &str) -> Result<()>;

    /// Commit the transaction.
    fn finish(&self) -> Result<()>;

    /// Abandon the transaction.
    fn cancel(&self) -> Result<()>;
}

/// One entity-scoped event, as recorded or replayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    StartBulk {
        entity: String,
        columns: Columns,
    },
    StartGroupBulk {
        entity: String,
        group: String,
        key: String,
    },
    StartBlock {
        entity: String,
        columns: Columns,
    },
    Update {
        entity: String,
        columns: Columns,
        line: Line,
    },
    Remove {
        entity: String,
        id: String,
    },
}

impl ChannelEvent {
    pub fn entity(&self) -> &str {
        match self {
            ChannelEvent::StartBulk { entity, .. }
            | ChannelEvent::StartGroupBulk { entity, .. }
            | ChannelEvent::StartBlock { entity, .. }
            | ChannelEvent::Update { entity, .. }
            | ChannelEvent::Remove { entity, .. } => entity,
        }
    }

    /// Deliver this event to `sink`.
    pub fn replay(&self, sink: &dyn ChangeChannel) -> Result<()> {
        match self {
            ChannelEvent::StartBulk { entity, columns } => sink.start_bulk(entity, columns),
            ChannelEvent::StartGroupBulk { entity, group, key } => {
                sink.start_group_bulk(entity, group, key)
            }
            ChannelEvent::StartBlock { entity, columns } => sink.start_block(entity, columns),
            ChannelEvent::Update {
                entity,
                columns,
                line,
            } => sink.process_update(entity, columns, line),
            ChannelEvent::Remove { entity, id } => sink.process_remove(entity, id),
        }
    }
}
