use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Transaction identifier assigned at commit.
///
/// A `Tid` is the commit time in microseconds since the UNIX epoch, bumped
/// forward when needed so that ids are strictly increasing even if the wall
/// clock stalls or steps backwards. Ordering is plain integer ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(u64);

impl Tid {
    /// The zero tid. Never assigned to a commit; used as "before everything".
    pub const ZERO: Tid = Tid(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// The tid that corresponds to a wall-clock instant.
    ///
    /// Instants before the epoch map to [`Tid::ZERO`].
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(u64::try_from(at.timestamp_micros()).unwrap_or(0))
    }

    /// The commit time encoded in this tid.
    pub fn timestamp(&self) -> Result<DateTime<Utc>, TypeError> {
        let micros = i64::try_from(self.0)
            .map_err(|_| TypeError::TimestampOutOfRange(self.0.to_string()))?;
        DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or_else(|| TypeError::TimestampOutOfRange(self.0.to_string()))
    }

    /// Allocate the tid for a new commit, given the last committed tid.
    ///
    /// The result is strictly after `last` and no earlier than `now`.
    pub fn next_after(last: Option<Tid>, now: DateTime<Utc>) -> Self {
        let wall = Self::from_datetime(now);
        match last {
            Some(last) if last >= wall => Self(last.0 + 1),
            _ => wall,
        }
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Tid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
