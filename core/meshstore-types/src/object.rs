//! Schema-less objects with per-attribute last-writer-wins merge.

use crate::{normalize_key, Condition, Error, ObjectId, Result, TimedValues, Timestamp};
use std::collections::{BTreeMap, BTreeSet};

/// An object: a map from lower-cased attribute keys to timed value sets.
///
/// Mutations only take effect when the new value supersedes the stored one
/// (see [`TimedValues::supersedes`]). Keys changed since the object was loaded
/// are tracked as dirty; only dirty keys are written back by the store.
#[derive(Debug, Clone)]
pub struct Object {
    id: ObjectId,
    attrs: BTreeMap<String, TimedValues>,
    dirty: BTreeSet<String>,
}

impl Object {
    /// Creates an empty object.
    #[must_use]
    pub fn new(id: impl Into<ObjectId>) -> Self {
        Self {
            id: id.into(),
            attrs: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Creates an empty object with a generated id.
    #[must_use]
    pub fn generate(type_prefix: &str) -> Self {
        Self::new(ObjectId::generate(type_prefix))
    }

    /// Returns the object id.
    #[must_use]
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Returns the live values for `key`.
    ///
    /// Fails with [`Error::KeyMissing`] if the key was never set or is
    /// tombstoned.
    pub fn get(&self, key: &str) -> Result<&TimedValues> {
        let key = normalize_key(key);
        match self.attrs.get(&key) {
            Some(tv) if !tv.is_tombstone() => Ok(tv),
            _ => Err(Error::KeyMissing(key)),
        }
    }

    /// Returns the stored entry for `key`, tombstones included.
    #[must_use]
    pub fn get_timed(&self, key: &str) -> Option<&TimedValues> {
        self.attrs.get(&normalize_key(key))
    }

    /// Returns true if `key` has at least one live value.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }

    /// Sets `key` to `values` at the current time.
    ///
    /// Returns false if a newer write is already stored.
    pub fn set<I, S>(&mut self, key: &str, values: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.apply(key, TimedValues::now(values))
    }

    /// Sets `key` to `values` at an explicit time.
    pub fn set_at<I, S>(&mut self, key: &str, values: I, timestamp: Timestamp) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.apply(key, TimedValues::new(values, timestamp))
    }

    /// Tombstones `key`.
    ///
    /// The tombstone is stamped strictly after the stored value even when the
    /// wall clock has not advanced, so it always takes effect locally.
    pub fn delete(&mut self, key: &str) -> bool {
        let now = Timestamp::now();
        let timestamp = match self.get_timed(key) {
            Some(stored) if stored.timestamp() >= now => stored.timestamp().next_after(),
            _ => now,
        };
        self.apply(key, TimedValues::tombstone(timestamp))
    }

    /// Merges a timed value into `key`, marking it dirty if it wins.
    pub fn apply(&mut self, key: &str, incoming: TimedValues) -> bool {
        let key = normalize_key(key);
        if let Some(stored) = self.attrs.get(&key) {
            if !incoming.supersedes(stored) {
                return false;
            }
        }
        self.attrs.insert(key.clone(), incoming);
        self.dirty.insert(key);
        true
    }

    /// Installs a persisted value without marking it dirty.
    pub fn merge(&mut self, key: &str, stored: TimedValues) {
        self.attrs.insert(normalize_key(key), stored);
    }

    /// Returns true if the stored values match the condition.
    #[must_use]
    pub fn matches(&self, condition: &Condition) -> bool {
        match condition {
            Condition::Equals { key, value } => self
                .get(key)
                .is_ok_and(|tv| tv.contains(value)),
            Condition::Prefix { key, value } => self
                .get(key)
                .is_ok_and(|tv| tv.values().iter().any(|v| v.starts_with(value.as_str()))),
            Condition::Any(key) => self.contains_key(key),
            Condition::Missing(key) => !self.contains_key(key),
            Condition::TimedBefore { key, timestamp } => self
                .get_timed(key)
                .is_some_and(|tv| tv.timestamp() < *timestamp),
            Condition::And(conditions) => conditions.iter().all(|c| self.matches(c)),
            Condition::Or(conditions) => conditions.iter().any(|c| self.matches(c)),
        }
    }

    /// Returns the newest write timestamp across all attributes.
    #[must_use]
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.attrs.values().map(TimedValues::timestamp).max()
    }

    /// Iterates over live attributes.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TimedValues)> {
        self.attrs
            .iter()
            .filter(|(_, tv)| !tv.is_tombstone())
            .map(|(k, tv)| (k.as_str(), tv))
    }

    /// Iterates over all stored attributes, tombstones included.
    pub fn iter_all(&self) -> impl Iterator<Item = (&str, &TimedValues)> {
        self.attrs.iter().map(|(k, tv)| (k.as_str(), tv))
    }

    /// Returns the keys with live values.
    #[must_use]
    pub fn live_keys(&self) -> Vec<&str> {
        self.iter().map(|(k, _)| k).collect()
    }

    /// Returns true if the object has no live attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Returns the keys modified since the object was loaded or last saved.
    pub fn dirty_keys(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Returns true if there are unsaved modifications.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Clears the dirty set after a successful write.
    pub fn mark_clean(&mut self) {
        self.dirty.clear();
    }
}

/// Objects compare by id and live attribute values, ignoring timestamps and
/// dirty state.
impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.iter().eq(other.iter())
    }
}

impl Eq for Object {}
