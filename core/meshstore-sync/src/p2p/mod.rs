//! TCP replication: codec, per-peer connections, and the node that owns them.

pub mod codec;
pub mod connection;
pub mod node;

pub use codec::SyncCodec;
pub use connection::{ConnectionConfig, ConnectionState, HandshakeOutcome, PeerInfo, SyncConnection};
pub use node::{NodeConfig, SyncNode};

use crate::error::{SyncError, SyncResult};
use meshstore_storage::{StorageResult, Store};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a store operation on the blocking pool.
pub(crate) async fn with_store<T, F>(store: &Arc<Store>, f: F) -> SyncResult<T>
where
    F: FnOnce(&Store) -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
        .map_err(SyncError::from)
}
