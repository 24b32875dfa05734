//! Condition compiler and lazy query iterators.
//!
//! A [`Condition`] is lowered into one SQL predicate over `objects o`. Every
//! key the condition touches gets its own `LEFT JOIN` alias on `attributes`
//! (`a<key id>`) and, when values are compared, on `list_values`
//! (`v<key id>`). Conjunctions whose branches constrain the same key cannot
//! share an alias, so the later branch becomes an `o.id IN (...)` subquery.

use crate::error::StorageResult;
use crate::store::{Store, StoreInner};
use meshstore_types::{normalize_key, Condition, Object, ObjectId};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Rows fetched per page by the lazy iterators.
const PAGE_SIZE: i64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Join {
    Attribute,
    Values,
}

/// A compiled predicate plus the joins and parameters it needs.
#[derive(Debug, Clone, Default)]
pub(crate) struct Compiled {
    predicate: String,
    params: Vec<Value>,
    joins: BTreeMap<i64, Join>,
}

impl Compiled {
    fn constant(matches: bool) -> Self {
        Self {
            predicate: if matches { "1" } else { "0" }.to_string(),
            ..Self::default()
        }
    }

    fn leaf(key: i64, join: Join, predicate: String, params: Vec<Value>) -> Self {
        Self {
            predicate,
            params,
            joins: BTreeMap::from([(key, join)]),
        }
    }

    fn shares_key(&self, other: &Self) -> bool {
        other.joins.keys().any(|key| self.joins.contains_key(key))
    }

    fn merge_joins(&mut self, other: &BTreeMap<i64, Join>) {
        for (key, join) in other {
            let entry = self.joins.entry(*key).or_insert(*join);
            if *join > *entry {
                *entry = *join;
            }
        }
    }

    fn from_clause(&self) -> String {
        let mut from = String::from("objects o");
        for (key, join) in &self.joins {
            from.push_str(&format!(
                " LEFT JOIN attributes a{key} ON a{key}.obj = o.id AND a{key}.key = {key}"
            ));
            if *join == Join::Values {
                from.push_str(&format!(" LEFT JOIN list_values v{key} ON v{key}.list = a{key}.list"));
            }
        }
        from
    }

    fn select_ids(&self) -> String {
        format!(
            "SELECT DISTINCT o.id FROM {} WHERE {}",
            self.from_clause(),
            self.predicate
        )
    }

    fn page_sql(&self) -> String {
        format!(
            "SELECT DISTINCT o.id, o.name FROM {} WHERE ({}) AND o.id > ? ORDER BY o.id LIMIT ?",
            self.from_clause(),
            self.predicate
        )
    }
}

/// Lowers a condition into SQL, resolving keys through the store's intern table.
pub(crate) fn compile(inner: &mut StoreInner, condition: &Condition) -> StorageResult<Compiled> {
    let compiled = match condition {
        Condition::Equals { key, value } => match inner.lookup_key(&normalize_key(key))? {
            Some(k) => Compiled::leaf(
                k,
                Join::Values,
                format!("v{k}.value = ?"),
                vec![Value::Text(value.clone())],
            ),
            None => Compiled::constant(false),
        },
        Condition::Prefix { key, value } => match inner.lookup_key(&normalize_key(key))? {
            Some(k) => {
                let len = i64::try_from(value.chars().count()).unwrap_or(i64::MAX);
                Compiled::leaf(
                    k,
                    Join::Values,
                    format!("substr(v{k}.value, 1, ?) = ?"),
                    vec![Value::Integer(len), Value::Text(value.clone())],
                )
            }
            None => Compiled::constant(false),
        },
        Condition::Any(key) => match inner.lookup_key(&normalize_key(key))? {
            Some(k) => Compiled::leaf(k, Join::Attribute, format!("a{k}.list IS NOT NULL"), Vec::new()),
            None => Compiled::constant(false),
        },
        Condition::Missing(key) => match inner.lookup_key(&normalize_key(key))? {
            Some(k) => Compiled::leaf(k, Join::Attribute, format!("a{k}.list IS NULL"), Vec::new()),
            None => Compiled::constant(true),
        },
        Condition::TimedBefore { key, timestamp } => match inner.lookup_key(&normalize_key(key))? {
            Some(k) => Compiled::leaf(
                k,
                Join::Attribute,
                format!("a{k}.tstamp < ?"),
                vec![Value::Real(timestamp.as_secs())],
            ),
            None => Compiled::constant(false),
        },
        Condition::Or(branches) => {
            if branches.is_empty() {
                return Ok(Compiled::constant(false));
            }
            let mut out = Compiled::default();
            let mut parts = Vec::with_capacity(branches.len());
            for branch in branches {
                let branch = compile(inner, branch)?;
                parts.push(format!("({})", branch.predicate));
                out.params.extend(branch.params);
                out.merge_joins(&branch.joins);
            }
            out.predicate = parts.join(" OR ");
            out
        }
        Condition::And(branches) => {
            if branches.is_empty() {
                return Ok(Compiled::constant(true));
            }
            let mut out = Compiled::default();
            let mut parts = Vec::with_capacity(branches.len());
            for branch in branches {
                let branch = compile(inner, branch)?;
                if out.shares_key(&branch) {
                    parts.push(format!("o.id IN ({})", branch.select_ids()));
                } else {
                    parts.push(format!("({})", branch.predicate));
                    out.merge_joins(&branch.joins);
                }
                out.params.extend(branch.params);
            }
            out.predicate = parts.join(" AND ");
            out
        }
    };
    Ok(compiled)
}

fn fetch_page(
    inner: &StoreInner,
    query: &Compiled,
    after: i64,
    limit: i64,
) -> StorageResult<Vec<(i64, ObjectId)>> {
    let mut params = query.params.clone();
    params.push(Value::Integer(after));
    params.push(Value::Integer(limit));

    let mut stmt = inner.conn.prepare(&query.page_sql())?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, ObjectId::new(row.get::<_, String>(1)?)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Collects every matching id in one pass.
pub(crate) fn collect_ids(inner: &StoreInner, query: &Compiled) -> StorageResult<Vec<ObjectId>> {
    Ok(fetch_page(inner, query, 0, -1)?
        .into_iter()
        .map(|(_, id)| id)
        .collect())
}

// ── Iterators ────────────────────────────────────────────────────

/// Lazily yields ids of matching objects in internal-id order.
///
/// Pages are fetched on demand with a keyset cursor, so writes made while
/// iterating never cause an object to be yielded twice.
pub struct ObjectIdIter<'s> {
    store: &'s Store,
    query: Compiled,
    after: i64,
    buffer: VecDeque<(i64, ObjectId)>,
    exhausted: bool,
}

impl<'s> ObjectIdIter<'s> {
    pub(crate) fn new(store: &'s Store, query: Compiled) -> Self {
        Self {
            store,
            query,
            after: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn refill(&mut self) -> StorageResult<()> {
        let (query, after) = (&self.query, self.after);
        let page = self
            .store
            .with_inner(|inner| fetch_page(inner, query, after, PAGE_SIZE))?;
        if (page.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.after = *last;
        }
        self.buffer.extend(page);
        Ok(())
    }

    fn next_entry(&mut self) -> Option<StorageResult<(i64, ObjectId)>> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl Iterator for ObjectIdIter<'_> {
    type Item = StorageResult<ObjectId>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().map(|entry| entry.map(|(_, id)| id))
    }
}

/// Lazily yields matching objects, loading each one as it is reached.
pub struct ObjectIter<'s> {
    ids: ObjectIdIter<'s>,
    fields: Option<BTreeSet<String>>,
}

impl<'s> ObjectIter<'s> {
    pub(crate) fn new(store: &'s Store, query: Compiled, fields: Option<BTreeSet<String>>) -> Self {
        Self {
            ids: ObjectIdIter::new(store, query),
            fields,
        }
    }
}

impl Iterator for ObjectIter<'_> {
    type Item = StorageResult<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        let (internal, _) = match self.ids.next_entry()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        let fields = self.fields.as_ref();
        Some(
            self.ids
                .store
                .with_inner(|inner| inner.load_internal(internal, fields)),
        )
    }
}

/// Ordering applied by [`Store::query_keyed`].
#[derive(Clone, Default)]
pub enum SortMethod {
    /// By matched value, ascending.
    #[default]
    ValueAsc,
    /// By matched value, descending.
    ValueDesc,
    /// By the sort key's write timestamp, oldest first.
    TimestampAsc,
    /// By the sort key's write timestamp, newest first.
    TimestampDesc,
    /// Maps each value through a function, then sorts ascending by the
    /// result. Pairs that map to the same `(value, object)` are yielded once.
    Split(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl SortMethod {
    pub fn split(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self::Split(Arc::new(f))
    }

    /// Groups values by the part after the first `separator`. Values without
    /// the separator map to the empty string.
    pub fn after_first(separator: char) -> Self {
        Self::split(move |value| {
            value
                .split_once(separator)
                .map(|(_, rest)| rest.to_string())
                .unwrap_or_default()
        })
    }

    fn order_by(&self) -> &'static str {
        match self {
            Self::ValueAsc | Self::Split(_) => "v.value ASC, o.id",
            Self::ValueDesc => "v.value DESC, o.id",
            Self::TimestampAsc => "a.tstamp ASC, o.id, v.value",
            Self::TimestampDesc => "a.tstamp DESC, o.id, v.value",
        }
    }
}

impl fmt::Debug for SortMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueAsc => f.write_str("ValueAsc"),
            Self::ValueDesc => f.write_str("ValueDesc"),
            Self::TimestampAsc => f.write_str("TimestampAsc"),
            Self::TimestampDesc => f.write_str("TimestampDesc"),
            Self::Split(_) => f.write_str("Split(..)"),
        }
    }
}

/// Lazily yields `(sort value, object)` pairs.
///
/// The ordered `(value, id)` index is read on the first call to `next`;
/// objects are loaded one at a time after that.
pub struct KeyedIter<'s> {
    store: &'s Store,
    query: Compiled,
    sort_key: String,
    fields: Option<BTreeSet<String>>,
    method: SortMethod,
    entries: Option<VecDeque<(String, i64)>>,
}

impl<'s> KeyedIter<'s> {
    pub(crate) fn new(
        store: &'s Store,
        query: Compiled,
        sort_key: String,
        fields: Option<BTreeSet<String>>,
        method: SortMethod,
    ) -> Self {
        Self {
            store,
            query,
            sort_key,
            fields,
            method,
            entries: None,
        }
    }

    fn load_entries(&self) -> StorageResult<VecDeque<(String, i64)>> {
        let mut entries = self.store.with_inner(|inner| self.fetch_entries(inner))?;
        if let SortMethod::Split(f) = &self.method {
            for entry in &mut entries {
                entry.0 = f(&entry.0);
            }
            entries.sort();
            entries.dedup();
        }
        Ok(entries.into())
    }

    fn fetch_entries(&self, inner: &mut StoreInner) -> StorageResult<Vec<(String, i64)>> {
        let Some(key) = inner.lookup_key(&self.sort_key)? else {
            return Ok(Vec::new());
        };

        let sql = format!(
            "SELECT v.value, o.id FROM attributes a
             JOIN list_values v ON v.list = a.list
             JOIN objects o ON o.id = a.obj
             WHERE a.key = ? AND o.id IN ({})
             ORDER BY {}",
            self.query.select_ids(),
            self.method.order_by()
        );
        let mut params = vec![Value::Integer(key)];
        params.extend(self.query.params.iter().cloned());

        let mut stmt = inner.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

impl Iterator for KeyedIter<'_> {
    type Item = StorageResult<(String, Object)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.entries.is_none() {
            match self.load_entries() {
                Ok(entries) => self.entries = Some(entries),
                Err(e) => {
                    self.entries = Some(VecDeque::new());
                    return Some(Err(e));
                }
            }
        }
        let (value, internal) = self.entries.as_mut()?.pop_front()?;
        let fields = self.fields.as_ref();
        Some(
            self.store
                .with_inner(|inner| inner.load_internal(internal, fields))
                .map(|object| (value, object)),
        )
    }
}
