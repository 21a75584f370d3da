//! In-memory recording of one transaction.

use crate::error::{CacheError, Result};
use crate::types::{Columns, Line};
use parking_lot::Mutex;

use super::callback::{ChangeChannel, ChannelEvent};

#[derive(Debug, Default)]
struct BufferState {
    open: bool,
    finished: bool,
    events: Vec<ChannelEvent>,
}

/// A [`ChangeChannel`] that records every event it receives.
///
/// Used to fetch from an origin before comparing against the cache, and
/// by tests as a recording subscriber.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    state: Mutex<BufferState>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, in arrival order.
    pub fn events(&self) -> Vec<ChannelEvent> {
        self.state.lock().events.clone()
    }

    /// Remove and return the recorded events.
    pub fn take_events(&self) -> Vec<ChannelEvent> {
        let mut state = self.state.lock();
        state.finished = false;
        std::mem::take(&mut state.events)
    }

    /// Whether the last transaction was committed.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Lines updated for `entity`, in arrival order.
    pub fn lines_for(&self, entity: &str) -> Vec<Line> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Update { entity: en, line, .. } if en == entity => {
                    Some(line.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Ids removed for `entity`, in arrival order.
    pub fn removed_for(&self, entity: &str) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Remove { entity: en, id } if en == entity => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: ChannelEvent) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(CacheError::ProtocolViolation(format!(
                "{:?} received outside a transaction",
                event
            )));
        }
        state.events.push(event);
        Ok(())
    }
}

impl ChangeChannel for TransactionBuffer {
    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.open {
            return Err(CacheError::ProtocolViolation(
                "start() called twice on a transaction buffer".into(),
            ));
        }
        state.open = true;
        state.finished = false;
        state.events.clear();
        Ok(())
    }

    fn start_bulk(&self, entity: &str, columns: &Columns) -> Result<()> {
        self.record(ChannelEvent::StartBulk {
            entity: entity.to_string(),
            columns: columns.clone(),
        })
    }

    fn start_group_bulk(&self, entity: &str, group: &str, key: &str) -> Result<()> {
        self.record(ChannelEvent::StartGroupBulk {
            entity: entity.to_string(),
            group: group.to_string(),
            key: key.to_string(),
        })
    }

    fn start_block(&self, entity: &str, columns: &Columns) -> Result<()> {
        self.record(ChannelEvent::StartBlock {
            entity: entity.to_string(),
            columns: columns.clone(),
        })
    }

    fn process_update(&self, entity: &str, columns: &Columns, line: &Line) -> Result<()> {
        self.record(ChannelEvent::Update {
            entity: entity.to_string(),
            columns: columns.clone(),
            line: line.clone(),
        })
    }

    fn process_remove(&self, entity: &str, id: &str) -> Result<()> {
        self.record(ChannelEvent::Remove {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    }

    fn finish(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(CacheError::ProtocolViolation(
                "finish() without start()".into(),
            ));
        }
        state.open = false;
        state.finished = true;
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.open = false;
        state.finished = false;
        state.events.clear();
        Ok(())
    }
}
