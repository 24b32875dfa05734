//! Query condition algebra.

use crate::{normalize_key, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A predicate over an object's attributes.
///
/// Evaluated in memory by [`crate::Object::matches`] and compiled to SQL by
/// the storage engine; both follow the same semantics:
/// - `Equals` / `Prefix` test the live values of a key
/// - `Any` holds when the key has at least one live value, `Missing` when it
///   is absent or tombstoned
/// - `TimedBefore` holds when the key was last written before the timestamp,
///   including tombstone writes
/// - an empty `And` is true, an empty `Or` is false
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Equals { key: String, value: String },
    Prefix { key: String, value: String },
    Any(String),
    Missing(String),
    TimedBefore { key: String, timestamp: Timestamp },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn equals(key: &str, value: impl Into<String>) -> Self {
        Self::Equals {
            key: normalize_key(key),
            value: value.into(),
        }
    }

    /// Matches if the key holds any of `values`.
    pub fn equals_any<I, S>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::one_of(values.into_iter().map(|v| Self::equals(key, v)))
    }

    pub fn prefix(key: &str, value: impl Into<String>) -> Self {
        Self::Prefix {
            key: normalize_key(key),
            value: value.into(),
        }
    }

    /// Matches if any value of the key starts with any of `values`.
    pub fn prefix_any<I, S>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::one_of(values.into_iter().map(|v| Self::prefix(key, v)))
    }

    pub fn any(key: &str) -> Self {
        Self::Any(normalize_key(key))
    }

    pub fn missing(key: &str) -> Self {
        Self::Missing(normalize_key(key))
    }

    pub fn timed_before(key: &str, timestamp: Timestamp) -> Self {
        Self::TimedBefore {
            key: normalize_key(key),
            timestamp,
        }
    }

    /// Conjunction. A single condition is returned unwrapped.
    pub fn all_of(conditions: impl IntoIterator<Item = Condition>) -> Self {
        let mut conditions: Vec<_> = conditions.into_iter().collect();
        if conditions.len() == 1 {
            conditions.remove(0)
        } else {
            Self::And(conditions)
        }
    }

    /// Disjunction. A single condition is returned unwrapped.
    pub fn one_of(conditions: impl IntoIterator<Item = Condition>) -> Self {
        let mut conditions: Vec<_> = conditions.into_iter().collect();
        if conditions.len() == 1 {
            conditions.remove(0)
        } else {
            Self::Or(conditions)
        }
    }

    /// Returns every attribute key referenced in this condition tree.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<&str> {
        let mut keys = BTreeSet::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys<'a>(&'a self, keys: &mut BTreeSet<&'a str>) {
        match self {
            Self::Equals { key, .. }
            | Self::Prefix { key, .. }
            | Self::TimedBefore { key, .. }
            | Self::Any(key)
            | Self::Missing(key) => {
                keys.insert(key.as_str());
            }
            Self::And(conditions) | Self::Or(conditions) => {
                for c in conditions {
                    c.collect_keys(keys);
                }
            }
        }
    }
}
