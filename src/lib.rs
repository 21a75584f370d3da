//! # Rowcast
//!
//! Push-based distribution of reference data between a central origin and
//! many in-process consumers.
//!
//! ## Core Concepts
//!
//! - **Lines**: one record of an entity, carried as a delimited text row
//!   keyed by its id column
//! - **Origin caches**: double-buffered per-entity line stores, reloaded from
//!   an [`OriginSource`] and swapped in atomically
//! - **Change channels**: the transaction protocol (`start`, updates,
//!   removes, `finish` or `cancel`) every hop speaks
//! - **Consumer caches**: typed records rebuilt from lines, with observers
//!   and derived indices notified once per committed transaction
//!
//! ## Example
//!
//! ```ignore
//! use rowcast::{ConsumerCache, ConsumerConfig, OriginCache, OriginConfig, OutboundHub,
//!     SerdeConverter, TextBlockSource};
//!
//! let source = Arc::new(TextBlockSource::new());
//! source.set_block("currency", "id,name\nGBP,Pound Sterling\nEUR,Euro")?;
//!
//! let origin = OriginCache::open(source, OriginConfig::default(), Arc::new(OutboundHub::new()))?;
//!
//! let currencies = Arc::new(ConsumerCache::new(
//!     ConsumerConfig::new("currency"),
//!     SerdeConverter::<Currency>::new(),
//! ));
//! currencies.attach(&origin)?;
//! let pound = currencies.must_get("GBP")?;
//! ```

pub mod channel;
pub mod codec;
pub mod composite_id;
pub mod config;
pub mod consumer;
pub mod error;
pub mod groups;
pub mod origin;
pub mod types;

// Re-exports
pub use channel::{ChangeChannel, ChannelEvent, Multiplexer, Payload, Record, TransactionBuffer};
pub use composite_id::CompositeIdCodec;
pub use config::{ConsumerConfig, OriginConfig, UpdateMode};
pub use consumer::{
    CacheObserver, ConsumerCache, FieldTable, IndexDefinition, MultiIndex, RecordConverter,
    SerdeConverter, UniqueIndex,
};
pub use error::{CacheError, Result};
pub use groups::GroupIndex;
pub use origin::{
    CacheTransaction, ChannelSender, Delta, EntityCache, OriginCache, OriginSource, OutboundHub,
    OutboundMessage, OutboundSender, TextBlockSource,
};
pub use types::{Columns, DiffResult, Interest, Line, ObserverId, SubscriptionId, ID_COLUMN};
