//! Timestamped value sets.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// The value of one attribute: an unordered set of strings plus the time it
/// was written.
///
/// An empty set is a tombstone. Equality compares only the value set, never
/// the timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedValues {
    values: BTreeSet<String>,
    timestamp: Timestamp,
}

impl TimedValues {
    /// Creates a value set written at `timestamp`.
    pub fn new<I, S>(values: I, timestamp: Timestamp) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            timestamp,
        }
    }

    /// Creates a value set written now.
    pub fn now<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(values, Timestamp::now())
    }

    /// Creates a tombstone written at `timestamp`.
    #[must_use]
    pub fn tombstone(timestamp: Timestamp) -> Self {
        Self {
            values: BTreeSet::new(),
            timestamp,
        }
    }

    /// Returns the values, in sorted order.
    #[must_use]
    pub fn values(&self) -> &BTreeSet<String> {
        &self.values
    }

    /// Consumes self and returns the values.
    #[must_use]
    pub fn into_values(self) -> BTreeSet<String> {
        self.values
    }

    /// Returns the write timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns true if this marks a deleted attribute.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns true if the set contains `value`.
    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        self.values.contains(value)
    }

    /// Returns the single value if the set has exactly one.
    #[must_use]
    pub fn single(&self) -> Option<&str> {
        if self.values.len() == 1 {
            self.values.first().map(String::as_str)
        } else {
            None
        }
    }

    /// Decides whether this write replaces `stored` under last-writer-wins.
    ///
    /// A newer timestamp always wins. On equal timestamps the lexicographically
    /// greater value set wins, so the outcome never depends on delivery order.
    /// Identical writes do not supersede each other.
    #[must_use]
    pub fn supersedes(&self, stored: &Self) -> bool {
        match self.timestamp.cmp(&stored.timestamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.values > stored.values,
        }
    }
}

impl PartialEq for TimedValues {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for TimedValues {}
