//! The change-propagation protocol.
//!
//! Producers push transactions through a [`ChangeChannel`]:
//! - `start` opens a transaction
//! - per touched entity, an optional bulk or group-bulk marker, then a
//!   block of update and remove events
//! - `finish` commits, `cancel` abandons
//!
//! The [`Multiplexer`] fans each transaction out to entity-filtered
//! subscribers and is the single serialization point: at most one
//! transaction is open at a time, and the subscriber set cannot change
//! while it is.
//!
//! # Example
//!
//! ```ignore
//! let mux = Multiplexer::new();
//! let recorder = Arc::new(TransactionBuffer::new());
//! mux.subscribe(Interest::entity("customer"), recorder.clone())?;
//!
//! mux.start()?;
//! text_block::present_block("customer", "id,name\n1,Alice", &mux, false)?;
//! mux.finish()?;
//!
//! assert_eq!(recorder.lines_for("customer").len(), 1);
//! ```

mod buffer;
mod callback;
mod multiplexer;
pub mod text_block;

pub use buffer::TransactionBuffer;
pub use callback::{ChangeChannel, ChannelEvent};
pub use multiplexer::Multiplexer;
pub use text_block::{Payload, Record};
