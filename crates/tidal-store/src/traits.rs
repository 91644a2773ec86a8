use std::collections::{HashMap, HashSet};

use tidal_types::{LoadedBefore, ObjectRecord, ObjectWrite, Oid, Tid, TransactionMeta, VersionInfo};

use crate::error::StoreResult;

/// Outcome of one guarded sweep batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The batch was deleted.
    Deleted {
        objects: usize,
        history: usize,
        blobs: usize,
    },
    /// A commit landed after the guard tid; nothing was deleted.
    Stale { last_tid: Tid },
}

/// Rows removed by history pruning and log cleanup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub history: usize,
    pub blobs: usize,
    pub transactions: usize,
}

/// Current/history object storage over a relational backend.
///
/// All implementations must satisfy these invariants:
/// - `commit` is atomic: either every write and the transaction log row
///   become visible together, or nothing changes.
/// - `commit` re-checks every write's expected tid inside its own atomic
///   section and fails with `Conflict` on mismatch.
/// - In history-preserving mode the outgoing version of an overwritten object
///   is archived in the same atomic section, before the new row replaces it.
/// - Assigned tids are strictly increasing.
/// - The store never interprets `state`; only `refs` is read by pack.
pub trait ObjectStore: Send + Sync {
    /// Whether superseded versions are archived.
    fn history_preserving(&self) -> bool;

    /// Allocate a fresh object id. Never returns [`Oid::ROOT`].
    fn new_oid(&self) -> StoreResult<Oid>;

    /// The most recently committed tid, `None` for an empty store.
    fn last_tid(&self) -> StoreResult<Option<Tid>>;

    /// Load the current version of an object.
    fn load(&self, oid: Oid) -> StoreResult<Option<ObjectRecord>>;

    /// Load current versions of several objects in one grouped request.
    ///
    /// The result is positionally aligned with `oids`.
    fn load_many(&self, oids: &[Oid]) -> StoreResult<Vec<Option<ObjectRecord>>> {
        oids.iter().map(|oid| self.load(*oid)).collect()
    }

    /// Current tids of the given objects. Missing objects are absent from
    /// the map.
    fn current_tids(&self, oids: &[Oid]) -> StoreResult<HashMap<Oid, Tid>>;

    /// The version effective strictly before `before`, and the tid that
    /// superseded it.
    fn load_before(&self, oid: Oid, before: Tid) -> StoreResult<Option<LoadedBefore>>;

    /// Load the exact version `tid` of an object, current or archived.
    fn load_version(&self, oid: Oid, tid: Tid) -> StoreResult<Option<ObjectRecord>>;

    /// The blob stored with version `tid` of an object.
    fn load_blob(&self, oid: Oid, tid: Tid) -> StoreResult<Option<Vec<u8>>>;

    /// Versions of an object, newest first, optionally only those strictly
    /// before `before`. Returns the raw listing; chain verification is the
    /// caller's job.
    fn versions(&self, oid: Oid, before: Option<Tid>, limit: usize)
        -> StoreResult<Vec<VersionInfo>>;

    /// Objects written by transaction `tid` (current or archived versions).
    fn oids_in_transaction(&self, tid: Tid) -> StoreResult<Vec<Oid>>;

    /// Boundary of the last history-pruning pack, if any.
    fn packed_before(&self) -> StoreResult<Option<Tid>>;

    /// Atomically validate and apply a batch, returning the assigned tid.
    fn commit(&self, meta: &TransactionMeta, writes: &[ObjectWrite]) -> StoreResult<Tid>;

    /// Objects whose current version was committed after `since`, together
    /// with the last committed tid.
    fn changes_since(&self, since: Tid) -> StoreResult<(Option<Tid>, Vec<Oid>)>;

    /// Every object reachable from `roots` over stored refs, roots included.
    fn reachable_from(&self, roots: &[Oid]) -> StoreResult<HashSet<Oid>>;

    /// Objects whose current version was committed at or before `snapshot`.
    fn oids_committed_upto(&self, snapshot: Tid) -> StoreResult<Vec<(Oid, Tid)>>;

    /// Delete objects with all their history and blobs, but only if nothing
    /// was committed after `guard`.
    fn delete_objects(&self, oids: &[Oid], guard: Tid) -> StoreResult<SweepOutcome>;

    /// Drop archived versions strictly older than `boundary` except the
    /// newest one before it, then remove blobs and log rows no version
    /// refers to. In history-free mode only the cleanup runs.
    fn prune_history(&self, boundary: Tid) -> StoreResult<PruneOutcome>;

    /// Remove every archived version and the blobs only they referred to.
    /// In history-preserving mode the pack boundary moves past the last tid,
    /// since every surviving version now links to a removed predecessor.
    fn drop_history(&self) -> StoreResult<PruneOutcome>;
}
