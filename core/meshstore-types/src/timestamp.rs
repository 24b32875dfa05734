//! Wall-clock timestamps for attribute writes.
//!
//! Timestamps are seconds since the Unix epoch as `f64`, which is also the
//! representation on the wire. Comparison uses the IEEE total order so the
//! type can be `Ord` and drive last-writer-wins decisions.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    /// The epoch itself. Every real write is newer than this.
    pub const ZERO: Self = Self(0.0);

    /// Creates a timestamp at the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self(secs)
    }

    /// Creates a timestamp from seconds since the epoch.
    #[must_use]
    pub const fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// False for infinities and NaN, which cannot be stored or sent.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.0.is_finite()
    }

    /// Returns the seconds since the epoch.
    #[must_use]
    pub const fn as_secs(&self) -> f64 {
        self.0
    }

    /// Returns the smallest timestamp strictly greater than this one.
    #[must_use]
    pub fn next_after(&self) -> Self {
        Self(self.0.next_up())
    }

    /// Returns this timestamp moved back by `duration`.
    #[must_use]
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self((self.0 - duration.as_secs_f64()).max(0.0))
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

impl From<f64> for Timestamp {
    fn from(secs: f64) -> Self {
        Self(secs)
    }
}
