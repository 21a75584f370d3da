//! The origin tier.
//!
//! An [`OriginCache`] holds one [`EntityCache`] per entity, loaded from an
//! [`OriginSource`]. Changes reach it three ways:
//! - full or group reloads from the source
//! - id notifications from the transport, re-fetched and diffed before
//!   anything is published
//! - transactions driven directly by trusted producers via
//!   [`OriginCache::begin`]
//!
//! Each committed transaction is forwarded to subscribers and rendered once
//! for every registered [`OutboundSender`].
//!
//! # Example
//!
//! ```ignore
//! let source = Arc::new(TextBlockSource::new());
//! source.set_block("customer", "id,name\n1,Alice")?;
//!
//! let hub = Arc::new(OutboundHub::new());
//! let origin = OriginCache::open(source.clone(), OriginConfig::default(), hub)?;
//! let outbound = origin.outbound_channel();
//!
//! source.upsert("customer", &[Some("1"), Some("Alicia")])?;
//! origin.apply_external_update("customer", &ids)?;
//!
//! let message = outbound.recv()?;
//! ```

mod cache;
pub mod differ;
mod entity_cache;
mod outbound;
mod source;

pub use cache::{CacheTransaction, OriginCache};
pub use differ::Delta;
pub use entity_cache::EntityCache;
pub use outbound::{ChannelSender, OutboundHub, OutboundMessage, OutboundSender};
pub use source::{OriginSource, TextBlockSource};
