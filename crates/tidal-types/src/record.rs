use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::oid::Oid;
use crate::tid::Tid;

/// One stored version of an object.
///
/// `state` is opaque to the storage core: it is produced and consumed only by
/// the codec boundary. `refs` is the declared set of outgoing references and
/// is the only thing pack looks at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub oid: Oid,
    pub tid: Tid,
    /// The tid this version superseded, `None` for the first version.
    pub prev_tid: Option<Tid>,
    pub state: Vec<u8>,
    pub refs: BTreeSet<Oid>,
}

impl ObjectRecord {
    /// Size of the opaque state in bytes.
    pub fn size(&self) -> usize {
        self.state.len()
    }
}

/// A staged write: new state for `oid`, valid only if the object's current
/// tid still equals `expected_tid` at commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectWrite {
    pub oid: Oid,
    /// `None` means the object must not exist yet.
    pub expected_tid: Option<Tid>,
    pub state: Vec<u8>,
    pub refs: BTreeSet<Oid>,
    /// Optional binary payload stored alongside this version.
    pub blob: Option<Vec<u8>>,
}

impl ObjectWrite {
    pub fn new(
        oid: Oid,
        expected_tid: Option<Tid>,
        state: Vec<u8>,
        refs: impl IntoIterator<Item = Oid>,
    ) -> Self {
        Self {
            oid,
            expected_tid,
            state,
            refs: refs.into_iter().collect(),
            blob: None,
        }
    }

    pub fn with_blob(mut self, blob: Vec<u8>) -> Self {
        self.blob = Some(blob);
        self
    }
}

/// Metadata recorded in the transaction log for every commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    pub user: String,
    pub description: String,
    /// Opaque application-defined extension data.
    pub extension: Vec<u8>,
}

impl TransactionMeta {
    pub fn new(user: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            description: description.into(),
            extension: Vec::new(),
        }
    }
}

/// Result of a point-in-time read: the version effective strictly before a
/// tid, and the tid that replaced it (if any).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedBefore {
    pub record: ObjectRecord,
    /// `None` if `record` is still the current version.
    pub end_tid: Option<Tid>,
}

impl LoadedBefore {
    pub fn start_tid(&self) -> Tid {
        self.record.tid
    }
}

/// One entry of an object's history listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub tid: Tid,
    pub prev_tid: Option<Tid>,
    pub size: usize,
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub description: String,
}
