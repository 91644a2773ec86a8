use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for a persisted object.
///
/// Object ids are allocated by the store and never reused. The id `0` is
/// reserved for the persistence root, which anchors reachability for pack and
/// is never collected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(u64);

impl Oid {
    /// The persistence root.
    pub const ROOT: Oid = Oid(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw integer value, as stored in the backing database.
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Returns `true` if this is the persistence root.
    pub fn is_root(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:#x})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Oid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Oid> for u64 {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}
