//! Transactions and nested savepoints.

use crate::error::{StorageError, StorageResult};
use crate::query;
use crate::store::StoreInner;
use meshstore_types::{Condition, Object, ObjectId, TimedValues, Timestamp};
use std::cell::{RefCell, RefMut};

/// How a top-level transaction acquires the database lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    /// Take locks lazily on first read or write.
    #[default]
    Deferred,
    /// Take the write lock immediately.
    Immediate,
    /// Take an exclusive lock immediately.
    Exclusive,
}

impl TransactionMode {
    pub(crate) fn begin_statement(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

pub(crate) fn borrow(cell: &RefCell<StoreInner>) -> StorageResult<RefMut<'_, StoreInner>> {
    cell.try_borrow_mut().map_err(|_| StorageError::Busy)
}

/// One open transaction or savepoint.
///
/// Level 1 is the outermost transaction. A scope dropped without
/// [`finish`](Self::finish), as when the closure panics, rolls back.
pub(crate) struct Scope<'a> {
    cell: &'a RefCell<StoreInner>,
    level: usize,
    open: bool,
}

impl<'a> Scope<'a> {
    /// Opens a transaction, or a savepoint if one is already open. `mode`
    /// only applies to the outermost level.
    pub(crate) fn begin(cell: &'a RefCell<StoreInner>, mode: TransactionMode) -> StorageResult<Self> {
        let mut inner = borrow(cell)?;
        let level = inner.depth + 1;
        if level == 1 {
            inner.conn.execute_batch(mode.begin_statement())?;
        } else {
            inner.conn.execute_batch(&format!("SAVEPOINT sp{level}"))?;
        }
        inner.depth = level;
        Ok(Self {
            cell,
            level,
            open: true,
        })
    }

    pub(crate) fn transaction(&self) -> Transaction<'a> {
        Transaction {
            cell: self.cell,
            depth: self.level - 1,
        }
    }

    /// Commits on `Ok`, rolls back on `Err`, and passes `result` through.
    pub(crate) fn finish<T, E>(mut self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let mut inner = borrow(self.cell)?;
        self.open = false;
        match result {
            Ok(value) => {
                inner.commit(self.level)?;
                Ok(value)
            }
            Err(e) => {
                inner.abort(self.level);
                Err(e)
            }
        }
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Ok(mut inner) = self.cell.try_borrow_mut() {
                inner.abort(self.level);
            }
        }
    }
}

/// An open transaction, handed to the closure passed to
/// [`Store::transaction`](crate::Store::transaction).
pub struct Transaction<'a> {
    cell: &'a RefCell<StoreInner>,
    depth: usize,
}

impl<'a> Transaction<'a> {
    pub(crate) fn inner(&self) -> StorageResult<RefMut<'a, StoreInner>> {
        borrow(self.cell)
    }

    /// Savepoint nesting level; zero for the top-level transaction.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Runs `f` inside a savepoint.
    ///
    /// An error from `f` rolls back only the savepoint's writes and is then
    /// returned to the caller, who may recover and keep using the outer
    /// transaction.
    pub fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let scope = Scope::begin(self.cell, TransactionMode::Deferred)?;
        let result = f(&mut scope.transaction());
        scope.finish(result)
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Persists the dirty keys of `object`.
    ///
    /// Each key is re-checked against the stored row; keys that lost to a
    /// newer stored value are skipped. Returns the number of keys written.
    /// The object stays dirty: an enclosing block may still roll back.
    /// [`Store::update`](crate::Store::update) marks it clean once the write
    /// has committed.
    pub fn update(&mut self, object: &Object) -> StorageResult<usize> {
        let mut inner = self.inner()?;
        let mut written = 0;
        for key in object.dirty_keys() {
            let Some(values) = object.get_timed(key) else {
                continue;
            };
            if inner
                .write_attr(object.id().as_str(), key, values)?
                .is_some()
            {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Writes one attribute if it supersedes the stored row, returning the
    /// serial it was assigned.
    pub fn update_attr(
        &mut self,
        object_id: &str,
        key: &str,
        values: &TimedValues,
    ) -> StorageResult<Option<i64>> {
        self.inner()?.write_attr(object_id, key, values)
    }

    /// Tombstones every live attribute of an object at `timestamp`.
    /// Returns the number of attributes deleted.
    pub fn delete(&mut self, object_id: &str, timestamp: Timestamp) -> StorageResult<usize> {
        let mut inner = self.inner()?;
        let Some(internal) = inner.lookup_object(object_id)? else {
            return Ok(0);
        };
        let tombstone = TimedValues::tombstone(timestamp);
        let mut deleted = 0;
        for key in inner.live_keys(internal)? {
            if inner.write_attr(object_id, &key, &tombstone)?.is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Loads an object as seen by this transaction.
    pub fn get(&mut self, id: &str, fields: Option<&[&str]>) -> StorageResult<Object> {
        let fields = fields.map(|f| f.iter().map(|k| meshstore_types::normalize_key(k)).collect());
        self.inner()?.load_object(id, fields.as_ref())
    }

    /// Returns every object id matching `condition`, as seen by this
    /// transaction.
    pub fn query_ids(&mut self, condition: &Condition) -> StorageResult<Vec<ObjectId>> {
        let mut inner = self.inner()?;
        let compiled = query::compile(&mut inner, condition)?;
        query::collect_ids(&inner, &compiled)
    }

    pub fn last_serial(&self) -> StorageResult<i64> {
        self.inner()?.last_serial()
    }

    pub fn sync_state(&self, peer: &str) -> StorageResult<i64> {
        self.inner()?.sync_state(peer)
    }

    pub fn set_sync_state(&mut self, peer: &str, serial: i64) -> StorageResult<()> {
        self.inner()?.set_sync_state(peer, serial)
    }
}
