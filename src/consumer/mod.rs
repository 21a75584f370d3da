//! The consumer tier.
//!
//! A [`ConsumerCache`] holds the typed records of one entity. It is a
//! [`ChangeChannel`](crate::channel::ChangeChannel): attach it to an
//! origin cache in the same process, or feed it wire payloads received
//! from a transport with [`ConsumerCache::apply_payload`].
//!
//! Lines become records through a [`RecordConverter`]:
//! - [`FieldTable`] binds columns to typed setters and checks at first use
//!   that columns and setters correspond one to one
//! - [`SerdeConverter`] binds through the record's `Deserialize` impl
//!
//! [`UniqueIndex`] and [`MultiIndex`] observe a cache and stay in step with
//! every commit.
//!
//! # Example
//!
//! ```ignore
//! let customers = Arc::new(ConsumerCache::new(
//!     ConsumerConfig::new("customer"),
//!     SerdeConverter::<Customer>::new(),
//! ));
//! customers.attach(&origin)?;
//! customers.wait_for_initial_load()?;
//!
//! let by_email = UniqueIndex::attach(
//!     &customers,
//!     IndexDefinition::new("by_email", |c: &Customer| c.email.clone()).unique(),
//! )?;
//! ```

mod cache;
mod convert;
mod index;

pub use cache::{CacheObserver, ConsumerCache};
pub use convert::{FieldTable, RecordConverter, SerdeConverter};
pub use index::{IndexDefinition, MultiIndex, Projection, UniqueIndex};
