use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tidal_cache::Invalidator;
use tidal_store::{ObjectStore, SweepOutcome};
use tidal_types::{CancelToken, Oid, Tid};

use crate::config::{PackConfig, RetentionPolicy};
use crate::error::{PackError, PackResult};

/// Re-marks allowed for a single batch before the sweep gives up.
const MAX_REMARKS_PER_BATCH: usize = 64;

/// Summary of a completed pack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackReport {
    pub objects_removed: usize,
    pub history_removed: usize,
    pub blobs_removed: usize,
    pub transactions_removed: usize,
    /// Objects reachable from the root at mark time.
    pub reachable: usize,
    /// Unreachable objects kept by the retention policy.
    pub candidates_deferred: usize,
    pub batches: usize,
    /// Times the sweep had to re-mark because of concurrent commits.
    pub remarks: usize,
}

/// Output of the mark phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Marked {
    /// Last committed tid when marking started. Only objects committed at or
    /// before it are candidates.
    pub snapshot: Tid,
    pub reachable: HashSet<Oid>,
    pub candidates: BTreeSet<Oid>,
    pub deferred: usize,
}

/// Reachability-based garbage collector.
///
/// Runs concurrently with transactions but never with itself.
pub struct PackCollector {
    store: Arc<dyn ObjectStore>,
    invalidator: Arc<dyn Invalidator>,
    config: PackConfig,
    running: Mutex<()>,
}

impl PackCollector {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        invalidator: Arc<dyn Invalidator>,
        config: PackConfig,
    ) -> Self {
        Self {
            store,
            invalidator,
            config,
            running: Mutex::new(()),
        }
    }

    /// Delete unreachable objects and prune history older than `boundary`.
    pub fn pack(&self, boundary: Tid, cancel: &CancelToken) -> PackResult<PackReport> {
        let _running = self.running.try_lock().ok_or(PackError::AlreadyRunning)?;

        check_cancel(cancel, 0)?;
        let marked = match self.mark(boundary)? {
            Some(marked) => marked,
            None => return Ok(PackReport::default()),
        };
        check_cancel(cancel, 0)?;

        let report = self.sweep(marked, boundary, cancel)?;
        info!(
            %boundary,
            reachable = report.reachable,
            removed = report.objects_removed,
            history = report.history_removed,
            deferred = report.candidates_deferred,
            batches = report.batches,
            remarks = report.remarks,
            "pack complete"
        );
        Ok(report)
    }

    /// Mark phase: compute the reachable set from the root and the deletion
    /// candidates. Returns `None` for an empty store.
    pub fn mark(&self, boundary: Tid) -> PackResult<Option<Marked>> {
        let Some(snapshot) = self.store.last_tid()? else {
            return Ok(None);
        };

        let reachable = self.store.reachable_from(&[Oid::ROOT])?;
        let protect_recent = self.store.history_preserving()
            && self.config.retention == RetentionPolicy::KeepAfterBoundary;

        let mut candidates = BTreeSet::new();
        let mut deferred = 0;
        for (oid, tid) in self.store.oids_committed_upto(snapshot)? {
            if oid.is_root() || reachable.contains(&oid) {
                continue;
            }
            if protect_recent && tid >= boundary {
                deferred += 1;
                continue;
            }
            candidates.insert(oid);
        }

        debug!(
            %snapshot,
            reachable = reachable.len(),
            candidates = candidates.len(),
            deferred,
            "mark complete"
        );
        Ok(Some(Marked {
            snapshot,
            reachable,
            candidates,
            deferred,
        }))
    }

    /// Sweep phase: delete candidates in guarded batches, then prune history.
    ///
    /// A batch is only deleted if nothing committed after its guard tid. When
    /// a commit did land, everything reachable from the objects it touched is
    /// removed from the candidates and the batch is retried with a newer
    /// guard.
    pub fn sweep(
        &self,
        marked: Marked,
        boundary: Tid,
        cancel: &CancelToken,
    ) -> PackResult<PackReport> {
        let mut report = PackReport {
            reachable: marked.reachable.len(),
            candidates_deferred: marked.deferred,
            ..PackReport::default()
        };
        let mut candidates = marked.candidates;
        let mut guard = marked.snapshot;
        let batch_size = self.config.batch_size.max(1);

        while !candidates.is_empty() {
            check_cancel(cancel, report.objects_removed)?;
            let batch: Vec<Oid> = candidates.iter().take(batch_size).copied().collect();

            let mut attempts = 0;
            loop {
                match self.store.delete_objects(&batch_ids(&batch, &candidates), guard)? {
                    SweepOutcome::Deleted {
                        objects,
                        history,
                        blobs,
                    } => {
                        let deleted = batch_ids(&batch, &candidates);
                        self.invalidator.invalidate(&deleted);
                        for oid in &deleted {
                            candidates.remove(oid);
                        }
                        report.objects_removed += objects;
                        report.history_removed += history;
                        report.blobs_removed += blobs;
                        report.batches += 1;
                        debug!(objects, history, blobs, "swept batch");
                        break;
                    }
                    SweepOutcome::Stale { last_tid } => {
                        attempts += 1;
                        if attempts > MAX_REMARKS_PER_BATCH {
                            warn!(attempts, "sweep could not keep up with commits");
                            return Err(PackError::Contended { attempts });
                        }
                        let (latest, changed) = self.store.changes_since(guard)?;
                        let rescued = self.store.reachable_from(&changed)?;
                        let before = candidates.len();
                        candidates.retain(|oid| !rescued.contains(oid));
                        guard = latest.unwrap_or(last_tid).max(last_tid);
                        report.remarks += 1;
                        debug!(
                            %guard,
                            changed = changed.len(),
                            rescued = before - candidates.len(),
                            "re-marked after concurrent commit"
                        );
                        if batch_ids(&batch, &candidates).is_empty() {
                            break;
                        }
                    }
                }
            }
        }

        let pruned = self.store.prune_history(boundary)?;
        report.history_removed += pruned.history;
        report.blobs_removed += pruned.blobs;
        report.transactions_removed += pruned.transactions;
        Ok(report)
    }
}

/// The members of `batch` that are still candidates.
fn batch_ids(batch: &[Oid], candidates: &BTreeSet<Oid>) -> Vec<Oid> {
    batch
        .iter()
        .filter(|oid| candidates.contains(oid))
        .copied()
        .collect()
}

fn check_cancel(cancel: &CancelToken, objects_removed: usize) -> PackResult<()> {
    if cancel.is_cancelled() {
        return Err(PackError::Cancelled { objects_removed });
    }
    Ok(())
}

impl std::fmt::Debug for PackCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackCollector")
            .field("config", &self.config)
            .field("running", &self.running.is_locked())
            .finish()
    }
}
