//! Store handle: schema, interning, object reads, and the replication log.

use crate::error::{StorageError, StorageResult};
use crate::query::{self, KeyedIter, ObjectIdIter, ObjectIter, SortMethod};
use crate::transaction::{borrow, Scope, Transaction, TransactionMode};
use meshstore_types::{
    normalize_key, Condition, Object, ObjectId, TimedValues, Timestamp, LOCAL_KEY_PREFIX,
};
use parking_lot::ReentrantMutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Tombstones younger than this survive [`Store::vacuum`] by default.
pub const DEFAULT_VACUUM_GRACE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        name TEXT PRIMARY KEY,
        value NOT NULL
    );

    CREATE TABLE IF NOT EXISTS objects (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS keys (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS lists (
        id INTEGER PRIMARY KEY,
        digest TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS list_values (
        list INTEGER NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (list, value)
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS list_values_by_value ON list_values (value, list);

    CREATE TABLE IF NOT EXISTS attributes (
        obj INTEGER NOT NULL,
        key INTEGER NOT NULL,
        tstamp REAL NOT NULL,
        list INTEGER,
        serial INTEGER NOT NULL UNIQUE,
        PRIMARY KEY (obj, key)
    );

    CREATE INDEX IF NOT EXISTS attributes_by_key ON attributes (key, list);

    CREATE TABLE IF NOT EXISTS sync_state (
        peer TEXT PRIMARY KEY,
        last_received INTEGER NOT NULL
    );

    INSERT OR IGNORE INTO meta (name, value) VALUES ('serial', 0);
";

/// One row of the replication log.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub object_id: ObjectId,
    pub key: String,
    pub timestamp: Timestamp,
    pub serial: i64,
    pub values: BTreeSet<String>,
}

impl Mapping {
    /// Returns the written value as a [`TimedValues`].
    #[must_use]
    pub fn timed_values(&self) -> TimedValues {
        TimedValues::new(self.values.iter().cloned(), self.timestamp)
    }
}

/// Row counts removed by a vacuum pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    pub attributes: usize,
    pub lists: usize,
    pub keys: usize,
    pub objects: usize,
}

/// Persistent object store backed by a single SQLite connection.
///
/// Every operation takes the engine lock, so writers are totally ordered and
/// serials increase in commit order. The lock is re-entrant: a thread inside
/// [`Store::transaction`] may call back into the store and sees its own
/// uncommitted writes.
pub struct Store {
    inner: ReentrantMutex<RefCell<StoreInner>>,
    node_name: String,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("node_name", &self.node_name)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    /// Opens a volatile in-memory store.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (name, value) VALUES ('node_name', ?1)",
            [Uuid::new_v4().simple().to_string()],
        )?;
        let node_name: String = conn.query_row(
            "SELECT value FROM meta WHERE name = 'node_name'",
            [],
            |row| row.get(0),
        )?;
        Ok(Self {
            inner: ReentrantMutex::new(RefCell::new(StoreInner::new(conn))),
            node_name,
        })
    }

    /// Returns the stable name this node announces to peers.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub(crate) fn with_inner<T>(
        &self,
        f: impl FnOnce(&mut StoreInner) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let guard = self.inner.lock();
        let mut inner = borrow(&guard)?;
        f(&mut inner)
    }

    // ── Transactions ─────────────────────────────────────────────

    /// Runs `f` inside a transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back otherwise.
    /// Called again from inside `f`, on the same thread, it joins the open
    /// transaction as a savepoint and `mode` is ignored.
    pub fn transaction<T, E, F>(&self, mode: TransactionMode, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let guard = self.inner.lock();
        let scope = Scope::begin(&guard, mode)?;
        let result = f(&mut scope.transaction());
        scope.finish(result)
    }

    /// Persists the dirty keys of `object` in its own transaction.
    ///
    /// The object is marked clean only when this call commits the outermost
    /// transaction.
    pub fn update(&self, object: &mut Object) -> StorageResult<usize> {
        let (written, outermost) = self.transaction(TransactionMode::Immediate, |tx| {
            Ok::<_, StorageError>((tx.update(object)?, tx.depth() == 0))
        })?;
        if outermost {
            object.mark_clean();
        }
        Ok(written)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Loads an object by id. Unknown ids yield an empty object.
    pub fn get(&self, id: &str, fields: Option<&[&str]>) -> StorageResult<Object> {
        let fields = field_set(fields);
        self.with_inner(|inner| inner.load_object(id, fields.as_ref()))
    }

    /// Loads an object by its internal id.
    pub fn get_internal(&self, internal: i64, fields: Option<&[&str]>) -> StorageResult<Object> {
        let fields = field_set(fields);
        self.with_inner(|inner| inner.load_internal(internal, fields.as_ref()))
    }

    /// Returns the internal id of an object, if it has ever been written.
    pub fn internal_id(&self, id: &str) -> StorageResult<Option<i64>> {
        self.with_inner(|inner| inner.lookup_object(id))
    }

    /// Returns up to `limit` replicable rows with a serial above `serial`,
    /// in serial order. Node-local keys are skipped.
    pub fn get_public_mappings_after(&self, serial: i64, limit: usize) -> StorageResult<Vec<Mapping>> {
        self.with_inner(|inner| inner.public_mappings_after(serial, limit))
    }

    /// Returns the highest serial issued by this store.
    pub fn last_serial(&self) -> StorageResult<i64> {
        self.with_inner(|inner| inner.last_serial())
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Lazily yields objects matching `condition`.
    pub fn query(&self, condition: &Condition, fields: Option<&[&str]>) -> StorageResult<ObjectIter<'_>> {
        let compiled = self.with_inner(|inner| query::compile(inner, condition))?;
        Ok(ObjectIter::new(self, compiled, field_set(fields)))
    }

    /// Lazily yields ids of objects matching `condition`.
    pub fn query_ids(&self, condition: &Condition) -> StorageResult<ObjectIdIter<'_>> {
        let compiled = self.with_inner(|inner| query::compile(inner, condition))?;
        Ok(ObjectIdIter::new(self, compiled))
    }

    /// Lazily yields `(sort value, object)` pairs for objects matching
    /// `condition`, one pair per value of `sort_key`, ordered by `method`.
    pub fn query_keyed(
        &self,
        condition: &Condition,
        sort_key: &str,
        fields: Option<&[&str]>,
        method: SortMethod,
    ) -> StorageResult<KeyedIter<'_>> {
        let compiled = self.with_inner(|inner| query::compile(inner, condition))?;
        Ok(KeyedIter::new(
            self,
            compiled,
            normalize_key(sort_key),
            field_set(fields),
            method,
        ))
    }

    // ── Sync state ───────────────────────────────────────────────

    /// Returns the highest serial received and applied from `peer`.
    pub fn sync_state(&self, peer: &str) -> StorageResult<i64> {
        self.with_inner(|inner| inner.sync_state(peer))
    }

    /// Records the highest serial received and applied from `peer`.
    pub fn set_sync_state(&self, peer: &str, serial: i64) -> StorageResult<()> {
        self.with_inner(|inner| inner.set_sync_state(peer, serial))
    }

    // ── Maintenance ──────────────────────────────────────────────

    /// Drops tombstones older than `grace` and everything they leave
    /// unreferenced. Holds the engine lock for the whole pass.
    pub fn vacuum(&self, grace: Duration) -> StorageResult<VacuumStats> {
        let cutoff = Timestamp::now().saturating_sub(grace);
        let stats = self.transaction(TransactionMode::Immediate, |tx| tx.inner()?.vacuum(cutoff))?;
        info!(
            "Vacuum removed {} tombstones, {} lists, {} keys, {} objects",
            stats.attributes, stats.lists, stats.keys, stats.objects
        );
        Ok(stats)
    }
}

fn field_set(fields: Option<&[&str]>) -> Option<BTreeSet<String>> {
    fields.map(|f| f.iter().map(|k| normalize_key(k)).collect())
}

/// Connection plus the interning caches that belong to it.
pub(crate) struct StoreInner {
    pub(crate) conn: Connection,
    /// Open transaction levels; zero outside any transaction.
    pub(crate) depth: usize,
    keys: HashMap<String, i64>,
    objects: HashMap<String, i64>,
}

impl StoreInner {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            depth: 0,
            keys: HashMap::new(),
            objects: HashMap::new(),
        }
    }

    /// Ids interned inside a rolled-back scope no longer exist.
    pub(crate) fn clear_caches(&mut self) {
        self.keys.clear();
        self.objects.clear();
    }

    pub(crate) fn rollback(&mut self, statement: &str) {
        if let Err(e) = self.conn.execute_batch(statement) {
            warn!("Rollback failed: {}", e);
        }
        self.clear_caches();
    }

    /// Closes transaction level `level`, keeping its writes.
    pub(crate) fn commit(&mut self, level: usize) -> StorageResult<()> {
        let statement = if level == 1 {
            "COMMIT".to_string()
        } else {
            format!("RELEASE sp{level}")
        };
        if let Err(e) = self.conn.execute_batch(&statement) {
            self.abort(level);
            return Err(e.into());
        }
        self.depth = level - 1;
        Ok(())
    }

    /// Closes transaction level `level`, discarding its writes.
    pub(crate) fn abort(&mut self, level: usize) {
        self.depth = level - 1;
        if level == 1 {
            self.rollback("ROLLBACK");
        } else {
            self.rollback(&format!("ROLLBACK TO sp{level}; RELEASE sp{level}"));
        }
    }

    // ── Interning ────────────────────────────────────────────────

    pub(crate) fn lookup_key(&mut self, key: &str) -> StorageResult<Option<i64>> {
        if let Some(id) = self.keys.get(key) {
            return Ok(Some(*id));
        }
        let id: Option<i64> = self
            .conn
            .query_row("SELECT id FROM keys WHERE name = ?1", [key], |row| row.get(0))
            .optional()?;
        if let Some(id) = id {
            self.keys.insert(key.to_string(), id);
        }
        Ok(id)
    }

    fn intern_key(&mut self, key: &str) -> StorageResult<i64> {
        if let Some(id) = self.lookup_key(key)? {
            return Ok(id);
        }
        self.conn.execute("INSERT INTO keys (name) VALUES (?1)", [key])?;
        let id = self.conn.last_insert_rowid();
        self.keys.insert(key.to_string(), id);
        Ok(id)
    }

    pub(crate) fn lookup_object(&mut self, id: &str) -> StorageResult<Option<i64>> {
        if let Some(internal) = self.objects.get(id) {
            return Ok(Some(*internal));
        }
        let internal: Option<i64> = self
            .conn
            .query_row("SELECT id FROM objects WHERE name = ?1", [id], |row| row.get(0))
            .optional()?;
        if let Some(internal) = internal {
            self.objects.insert(id.to_string(), internal);
        }
        Ok(internal)
    }

    fn intern_object(&mut self, id: &str) -> StorageResult<i64> {
        if let Some(internal) = self.lookup_object(id)? {
            return Ok(internal);
        }
        self.conn.execute("INSERT INTO objects (name) VALUES (?1)", [id])?;
        let internal = self.conn.last_insert_rowid();
        self.objects.insert(id.to_string(), internal);
        Ok(internal)
    }

    /// Returns the id of the list holding exactly `values`, creating it if
    /// needed. Empty sets have no list.
    fn intern_list(&self, values: &BTreeSet<String>) -> StorageResult<Option<i64>> {
        if values.is_empty() {
            return Ok(None);
        }
        let digest = serde_json::to_string(values)?;
        let existing: Option<i64> = self
            .conn
            .query_row("SELECT id FROM lists WHERE digest = ?1", [&digest], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Ok(existing);
        }

        self.conn.execute("INSERT INTO lists (digest) VALUES (?1)", [&digest])?;
        let list = self.conn.last_insert_rowid();
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO list_values (list, value) VALUES (?1, ?2)")?;
        for value in values {
            stmt.execute(params![list, value])?;
        }
        Ok(Some(list))
    }

    pub(crate) fn list_values(&self, list: Option<i64>) -> StorageResult<BTreeSet<String>> {
        let Some(list) = list else {
            return Ok(BTreeSet::new());
        };
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM list_values WHERE list = ?1")?;
        let values = stmt
            .query_map([list], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(values)
    }

    // ── Log ──────────────────────────────────────────────────────

    pub(crate) fn last_serial(&self) -> StorageResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE name = 'serial'", [], |row| row.get(0))?)
    }

    fn next_serial(&self) -> StorageResult<i64> {
        Ok(self.conn.query_row(
            "UPDATE meta SET value = value + 1 WHERE name = 'serial' RETURNING value",
            [],
            |row| row.get(0),
        )?)
    }

    fn public_mappings_after(&self, serial: i64, limit: usize) -> StorageResult<Vec<Mapping>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT o.name, k.name, a.tstamp, a.serial, a.list
             FROM attributes a
             JOIN objects o ON o.id = a.obj
             JOIN keys k ON k.id = a.key
             WHERE a.serial > ?1 AND substr(k.name, 1, 1) <> ?2
             ORDER BY a.serial
             LIMIT ?3",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(
            params![serial, LOCAL_KEY_PREFIX.to_string(), limit],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            },
        )?;

        let mut mappings = Vec::new();
        for row in rows {
            let (object_id, key, tstamp, serial, list) = row?;
            mappings.push(Mapping {
                object_id: ObjectId::new(object_id),
                key,
                timestamp: Timestamp::from_secs(tstamp),
                serial,
                values: self.list_values(list)?,
            });
        }
        Ok(mappings)
    }

    // ── Attribute rows ───────────────────────────────────────────

    fn stored_attr(&self, obj: i64, key: i64) -> StorageResult<Option<TimedValues>> {
        let row: Option<(f64, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT tstamp, list FROM attributes WHERE obj = ?1 AND key = ?2",
                params![obj, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((tstamp, list)) => Ok(Some(TimedValues::new(
                self.list_values(list)?,
                Timestamp::from_secs(tstamp),
            ))),
            None => Ok(None),
        }
    }

    /// Writes one attribute if it supersedes the stored row.
    ///
    /// Returns the serial assigned to the write, or `None` if the stored row
    /// is newer (or identical) and the write was discarded.
    pub(crate) fn write_attr(
        &mut self,
        object_id: &str,
        key: &str,
        incoming: &TimedValues,
    ) -> StorageResult<Option<i64>> {
        if !incoming.timestamp().is_finite() {
            return Err(StorageError::InvalidData(format!(
                "non-finite timestamp for {object_id}/{key}"
            )));
        }
        let key = normalize_key(key);
        let obj = self.intern_object(object_id)?;
        let key_id = self.intern_key(&key)?;
        if let Some(stored) = self.stored_attr(obj, key_id)? {
            if !incoming.supersedes(&stored) {
                return Ok(None);
            }
        }

        let list = self.intern_list(incoming.values())?;
        let serial = self.next_serial()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO attributes (obj, key, tstamp, list, serial)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![obj, key_id, incoming.timestamp().as_secs(), list, serial],
        )?;
        Ok(Some(serial))
    }

    pub(crate) fn live_keys(&self, obj: i64) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT k.name FROM attributes a JOIN keys k ON k.id = a.key
             WHERE a.obj = ?1 AND a.list IS NOT NULL",
        )?;
        let keys = stmt
            .query_map([obj], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    // ── Objects ──────────────────────────────────────────────────

    pub(crate) fn load_object(
        &mut self,
        id: &str,
        fields: Option<&BTreeSet<String>>,
    ) -> StorageResult<Object> {
        let mut object = Object::new(id);
        if let Some(internal) = self.lookup_object(id)? {
            self.load_attrs(&mut object, internal, fields)?;
        }
        Ok(object)
    }

    pub(crate) fn load_internal(
        &mut self,
        internal: i64,
        fields: Option<&BTreeSet<String>>,
    ) -> StorageResult<Object> {
        let name: String = self
            .conn
            .query_row("SELECT name FROM objects WHERE id = ?1", [internal], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("#{internal}")))?;
        self.objects.insert(name.clone(), internal);
        let mut object = Object::new(name);
        self.load_attrs(&mut object, internal, fields)?;
        Ok(object)
    }

    fn load_attrs(
        &self,
        object: &mut Object,
        internal: i64,
        fields: Option<&BTreeSet<String>>,
    ) -> StorageResult<()> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT k.name, a.tstamp, v.value
             FROM attributes a
             JOIN keys k ON k.id = a.key
             LEFT JOIN list_values v ON v.list = a.list
             WHERE a.obj = ?1",
        )?;
        let mut attrs: BTreeMap<String, (f64, BTreeSet<String>)> = BTreeMap::new();
        let mut rows = stmt.query([internal])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            if fields.is_some_and(|f| !f.contains(&key)) {
                continue;
            }
            let tstamp: f64 = row.get(1)?;
            let value: Option<String> = row.get(2)?;
            let entry = attrs.entry(key).or_insert_with(|| (tstamp, BTreeSet::new()));
            if let Some(value) = value {
                entry.1.insert(value);
            }
        }

        for (key, (tstamp, values)) in attrs {
            object.merge(&key, TimedValues::new(values, Timestamp::from_secs(tstamp)));
        }
        Ok(())
    }

    // ── Sync state ───────────────────────────────────────────────

    pub(crate) fn sync_state(&self, peer: &str) -> StorageResult<i64> {
        let serial: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_received FROM sync_state WHERE peer = ?1",
                [peer],
                |row| row.get(0),
            )
            .optional()?;
        Ok(serial.unwrap_or(0))
    }

    pub(crate) fn set_sync_state(&self, peer: &str, serial: i64) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO sync_state (peer, last_received) VALUES (?1, ?2)
             ON CONFLICT (peer) DO UPDATE SET last_received = excluded.last_received",
            params![peer, serial],
        )?;
        Ok(())
    }

    // ── Vacuum ───────────────────────────────────────────────────

    pub(crate) fn vacuum(&mut self, cutoff: Timestamp) -> StorageResult<VacuumStats> {
        let attributes = self.conn.execute(
            "DELETE FROM attributes WHERE list IS NULL AND tstamp < ?1",
            [cutoff.as_secs()],
        )?;
        self.conn.execute(
            "DELETE FROM list_values WHERE list NOT IN
             (SELECT list FROM attributes WHERE list IS NOT NULL)",
            [],
        )?;
        let lists = self.conn.execute(
            "DELETE FROM lists WHERE id NOT IN
             (SELECT list FROM attributes WHERE list IS NOT NULL)",
            [],
        )?;
        let keys = self.conn.execute(
            "DELETE FROM keys WHERE id NOT IN (SELECT key FROM attributes)",
            [],
        )?;
        let objects = self.conn.execute(
            "DELETE FROM objects WHERE id NOT IN (SELECT obj FROM attributes)",
            [],
        )?;
        self.clear_caches();
        Ok(VacuumStats {
            attributes,
            lists,
            keys,
            objects,
        })
    }
}
