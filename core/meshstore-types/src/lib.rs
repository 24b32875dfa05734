//! Core type definitions for meshstore.
//!
//! This crate defines the data model shared by the storage engine and the
//! sync layer:
//! - Object identifiers and wall-clock timestamps
//! - [`TimedValues`], the timestamped value set stored per attribute
//! - [`Object`], a map of attribute keys to timed values with last-writer-wins
//!   merge semantics
//! - [`Condition`], the query algebra evaluated in memory or compiled by the
//!   storage engine

mod condition;
mod ids;
mod object;
mod timestamp;
mod values;

pub use condition::Condition;
pub use ids::ObjectId;
pub use object::Object;
pub use timestamp::Timestamp;
pub use values::TimedValues;

/// Keys starting with this character are node-local bookkeeping and are
/// never replicated to peers.
pub const LOCAL_KEY_PREFIX: char = '_';

/// Returns true if `key` is reserved for node-local bookkeeping.
#[must_use]
pub fn is_local_key(key: &str) -> bool {
    key.starts_with(LOCAL_KEY_PREFIX)
}

/// Normalizes an attribute key. Keys are case-insensitive and stored lower-cased.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    key.to_lowercase()
}

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in object operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key missing: {0}")]
    KeyMissing(String),
}
