//! SQLite storage engine for meshstore.
//!
//! Provides persistent storage for schema-less objects plus the change log
//! used for replication.
//!
//! # Architecture
//!
//! - Objects and attribute keys are interned to integer ids, cached per store
//! - Each (object, key) pair has one row carrying its timestamp, a reference
//!   to a deduplicated value list, and a serial from the store-wide counter
//! - The serial order of rows is the replication log; peers resume from the
//!   last serial they acknowledged
//! - Conditions are compiled to SQL with one join per referenced key
//!
//! All access goes through a single connection behind one lock, which gives
//! the log a total order.

mod error;
mod query;
mod store;
mod transaction;

pub use error::{StorageError, StorageResult};
pub use query::{KeyedIter, ObjectIdIter, ObjectIter, SortMethod};
pub use store::{Mapping, Store, VacuumStats, DEFAULT_VACUUM_GRACE};
pub use transaction::{Transaction, TransactionMode};
