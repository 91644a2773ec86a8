//! Verified history listings and undo.

use tracing::{debug, info};

use tidal_store::{verify_chain, ObjectStore, PruneOutcome};
use tidal_types::{CancelToken, ObjectWrite, Oid, Tid, TransactionMeta, VersionInfo};

use crate::coordinator::Coordinator;
use crate::error::{TxnError, TxnResult};

/// Reads and rewrites object history through a [`Coordinator`].
///
/// Every listing is checked for gaps before it is returned: a version's
/// `prev_tid` must name the next older listed version. The only permitted
/// break is below the recorded pack boundary. Anything else is reported as
/// corruption and left untouched.
#[derive(Clone, Debug)]
pub struct HistoryManager {
    coordinator: Coordinator,
}

impl HistoryManager {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    fn store(&self) -> &dyn ObjectStore {
        self.coordinator.store().as_ref()
    }

    /// Up to `limit` versions of `oid`, newest first.
    pub fn history(&self, oid: Oid, limit: usize) -> TxnResult<Vec<VersionInfo>> {
        self.listing(oid, None, limit)
    }

    /// Up to `limit` versions strictly older than `before`, newest first.
    ///
    /// Passing the oldest tid of the previous page continues a listing.
    pub fn history_before(
        &self,
        oid: Oid,
        before: Tid,
        limit: usize,
    ) -> TxnResult<Vec<VersionInfo>> {
        self.listing(oid, Some(before), limit)
    }

    fn listing(&self, oid: Oid, before: Option<Tid>, limit: usize) -> TxnResult<Vec<VersionInfo>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let store = self.store();
        // One extra entry links the last returned version to its predecessor.
        let mut listing = store.versions(oid, before, limit.saturating_add(1))?;
        if store.history_preserving() {
            let reached_oldest = listing.len() <= limit;
            verify_chain(oid, &listing, reached_oldest, store.packed_before()?)?;
        }
        listing.truncate(limit);
        Ok(listing)
    }

    /// Revert every object written by `tid` to the version that preceded it,
    /// as a new forward commit.
    ///
    /// Each object must still be at `tid`; a later write makes the undo fail
    /// with a conflict. The undone versions stay in history.
    pub fn undo(&self, tid: Tid, meta: TransactionMeta) -> TxnResult<Tid> {
        self.undo_with_cancel(tid, meta, CancelToken::new())
    }

    pub fn undo_with_cancel(
        &self,
        tid: Tid,
        meta: TransactionMeta,
        cancel: CancelToken,
    ) -> TxnResult<Tid> {
        let store = self.store();
        if !store.history_preserving() {
            return Err(TxnError::InvalidOperation(
                "undo requires a history-preserving store".into(),
            ));
        }

        let oids = store.oids_in_transaction(tid)?;
        if oids.is_empty() {
            return Err(TxnError::InvalidOperation(format!(
                "transaction {tid} has no retained versions"
            )));
        }

        let mut txn = self.coordinator.begin_with(meta, cancel);
        for oid in oids {
            let undone = store
                .load_version(oid, tid)?
                .ok_or_else(|| TxnError::UndoConflict {
                    oid,
                    tid,
                    reason: "version is no longer stored".into(),
                })?;
            let Some(prev_tid) = undone.prev_tid else {
                return Err(TxnError::UndoConflict {
                    oid,
                    tid,
                    reason: "the transaction created the object".into(),
                });
            };
            let restored =
                store
                    .load_version(oid, prev_tid)?
                    .ok_or_else(|| TxnError::UndoConflict {
                        oid,
                        tid,
                        reason: format!("preceding version {prev_tid} was packed away"),
                    })?;

            let mut write = ObjectWrite::new(oid, Some(tid), restored.state, restored.refs);
            if let Some(blob) = store.load_blob(oid, prev_tid)? {
                write = write.with_blob(blob);
            }
            debug!(%oid, undone = %tid, restored = %prev_tid, "staging undo");
            txn.stage(write)?;
        }

        let new_tid = txn.commit()?;
        info!(undone = %tid, %new_tid, "undo committed");
        Ok(new_tid)
    }

    /// Remove every archived version. Cached entries stay valid since no
    /// current version changes.
    pub fn drop_history(&self) -> TxnResult<PruneOutcome> {
        let outcome = self.store().drop_history()?;
        info!(
            history = outcome.history,
            blobs = outcome.blobs,
            transactions = outcome.transactions,
            "dropped history"
        );
        Ok(outcome)
    }
}
