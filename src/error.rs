//! Error types for the caching tiers and the change protocol.

use crate::types::SubscriptionId;
use std::any::Any;
use thiserror::Error;

/// Main error type for cache and protocol operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Calls out of start/finish order, or an inconsistent transaction at commit.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A multiplexer subscriber failed during delivery. Only ever logged.
    #[error("Subscriber {id:?} failed: {source}")]
    Subscriber {
        id: SubscriptionId,
        #[source]
        source: Box<CacheError>,
    },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Could not convert {entity}/{id}: {reason}")]
    Conversion {
        entity: String,
        id: String,
        reason: String,
    },

    #[error("Column mismatch for {entity}: expected {expected}, got {got}")]
    ColumnMismatch {
        entity: String,
        expected: String,
        got: String,
    },

    #[error("Invalid column list: {0}")]
    InvalidColumns(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Unknown group {group} for entity {entity}")]
    UnknownGroup { entity: String, group: String },

    #[error("Duplicate key in unique index {index}: {key}")]
    DuplicateKey { index: String, key: String },

    #[error("Not found: {entity}/{id}")]
    NotFound { entity: String, id: String },

    /// Cancel reached a tier that cannot roll back a half-applied block.
    #[error("Transaction cancelled for {entity}; consumer cache poisoned")]
    TransactionCancelled { entity: String },

    #[error("Cache poisoned: {0}")]
    Poisoned(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Failure reported by the origin-read collaborator.
    #[error("Origin error: {0}")]
    Origin(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A callback panicked. The panic was caught at the delivery boundary.
    #[error("Callback panicked: {0}")]
    Panicked(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Config(e.to_string())
    }
}

/// The message carried by a caught panic, when it has one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
