use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use tidal_types::{
    LoadedBefore, ObjectRecord, ObjectWrite, Oid, Tid, TransactionMeta, VersionInfo,
};

use crate::error::{StoreError, StoreResult};
use crate::traits::{ObjectStore, PruneOutcome, SweepOutcome};
use crate::versions::resolve_before;

/// In-memory object store.
///
/// Intended for tests and embedding. The current, history, blob, and log
/// tables live behind one `RwLock`; holding the write lock for the whole of
/// `commit` is what makes a commit atomic.
pub struct InMemoryObjectStore {
    history_preserving: bool,
    offline: AtomicBool,
    inner: RwLock<Tables>,
}

struct LogEntry {
    timestamp: DateTime<Utc>,
    meta: TransactionMeta,
}

struct Tables {
    current: HashMap<Oid, ObjectRecord>,
    history: BTreeMap<(Oid, Tid), ObjectRecord>,
    blobs: BTreeMap<(Oid, Tid), Vec<u8>>,
    log: BTreeMap<Tid, LogEntry>,
    last_tid: Option<Tid>,
    next_oid: u64,
    packed_before: Option<Tid>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            current: HashMap::new(),
            history: BTreeMap::new(),
            blobs: BTreeMap::new(),
            log: BTreeMap::new(),
            last_tid: None,
            next_oid: 1,
            packed_before: None,
        }
    }
}

fn keys_for(oid: Oid) -> std::ops::RangeInclusive<(Oid, Tid)> {
    (oid, Tid::ZERO)..=(oid, Tid::new(u64::MAX))
}

impl Tables {
    /// All stored versions of `oid`, oldest first. On a duplicate tid the
    /// current row wins over the archived one.
    fn versions_ascending(&self, oid: Oid) -> Vec<&ObjectRecord> {
        let mut versions: Vec<&ObjectRecord> =
            self.history.range(keys_for(oid)).map(|(_, r)| r).collect();
        if let Some(current) = self.current.get(&oid) {
            versions.retain(|r| r.tid != current.tid);
            versions.push(current);
        }
        versions.sort_by_key(|r| r.tid);
        versions
    }

    fn version_info(&self, record: &ObjectRecord) -> VersionInfo {
        let entry = self.log.get(&record.tid);
        VersionInfo {
            tid: record.tid,
            prev_tid: record.prev_tid,
            size: record.size(),
            timestamp: entry
                .map(|e| e.timestamp)
                .or_else(|| record.tid.timestamp().ok())
                .unwrap_or_default(),
            user: entry.map(|e| e.meta.user.clone()).unwrap_or_default(),
            description: entry
                .map(|e| e.meta.description.clone())
                .unwrap_or_default(),
        }
    }

    fn remove_range<V>(map: &mut BTreeMap<(Oid, Tid), V>, oid: Oid, below: Option<Tid>) -> usize {
        let keys: Vec<(Oid, Tid)> = map
            .range(keys_for(oid))
            .map(|(k, _)| *k)
            .filter(|(_, tid)| below.map_or(true, |b| *tid < b))
            .collect();
        for key in &keys {
            map.remove(key);
        }
        keys.len()
    }

    /// Remove blobs and log rows no remaining version refers to.
    fn cleanup(&mut self) -> (usize, usize) {
        let live: HashSet<(Oid, Tid)> = self
            .current
            .values()
            .map(|r| (r.oid, r.tid))
            .chain(self.history.keys().copied())
            .collect();
        let live_tids: HashSet<Tid> = live.iter().map(|(_, tid)| *tid).collect();

        let blobs_before = self.blobs.len();
        self.blobs.retain(|key, _| live.contains(key));
        let logs_before = self.log.len();
        self.log.retain(|tid, _| live_tids.contains(tid));

        (blobs_before - self.blobs.len(), logs_before - self.log.len())
    }
}

impl InMemoryObjectStore {
    /// Create a new empty store.
    pub fn new(history_preserving: bool) -> Self {
        Self {
            history_preserving,
            offline: AtomicBool::new(false),
            inner: RwLock::new(Tables::default()),
        }
    }

    /// Simulate a backend outage: while offline every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of objects with a current version.
    pub fn len(&self) -> usize {
        self.inner.read().current.len()
    }

    /// Returns `true` if no object has a current version.
    pub fn is_empty(&self) -> bool {
        self.inner.read().current.is_empty()
    }

    /// Number of archived versions.
    pub fn history_len(&self) -> usize {
        self.inner.read().history.len()
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.inner.read().blobs.len()
    }

    /// Number of transaction log rows.
    pub fn transaction_count(&self) -> usize {
        self.inner.read().log.len()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".into()));
        }
        Ok(())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn history_preserving(&self) -> bool {
        self.history_preserving
    }

    fn new_oid(&self) -> StoreResult<Oid> {
        self.check_online()?;
        let mut tables = self.inner.write();
        let oid = Oid::new(tables.next_oid);
        tables.next_oid += 1;
        Ok(oid)
    }

    fn last_tid(&self) -> StoreResult<Option<Tid>> {
        self.check_online()?;
        Ok(self.inner.read().last_tid)
    }

    fn load(&self, oid: Oid) -> StoreResult<Option<ObjectRecord>> {
        self.check_online()?;
        Ok(self.inner.read().current.get(&oid).cloned())
    }

    fn load_many(&self, oids: &[Oid]) -> StoreResult<Vec<Option<ObjectRecord>>> {
        self.check_online()?;
        let tables = self.inner.read();
        Ok(oids.iter().map(|oid| tables.current.get(oid).cloned()).collect())
    }

    fn current_tids(&self, oids: &[Oid]) -> StoreResult<HashMap<Oid, Tid>> {
        self.check_online()?;
        let tables = self.inner.read();
        Ok(oids
            .iter()
            .filter_map(|oid| tables.current.get(oid).map(|r| (*oid, r.tid)))
            .collect())
    }

    fn load_before(&self, oid: Oid, before: Tid) -> StoreResult<Option<LoadedBefore>> {
        self.check_online()?;
        let tables = self.inner.read();
        let versions = tables.versions_ascending(oid);
        let tids: Vec<Tid> = versions.iter().map(|r| r.tid).collect();
        Ok(resolve_before(&tids, before).map(|(idx, end_tid)| LoadedBefore {
            record: versions[idx].clone(),
            end_tid,
        }))
    }

    fn load_version(&self, oid: Oid, tid: Tid) -> StoreResult<Option<ObjectRecord>> {
        self.check_online()?;
        let tables = self.inner.read();
        if let Some(current) = tables.current.get(&oid).filter(|r| r.tid == tid) {
            return Ok(Some(current.clone()));
        }
        Ok(tables.history.get(&(oid, tid)).cloned())
    }

    fn load_blob(&self, oid: Oid, tid: Tid) -> StoreResult<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(self.inner.read().blobs.get(&(oid, tid)).cloned())
    }

    fn versions(
        &self,
        oid: Oid,
        before: Option<Tid>,
        limit: usize,
    ) -> StoreResult<Vec<VersionInfo>> {
        self.check_online()?;
        let tables = self.inner.read();
        Ok(tables
            .versions_ascending(oid)
            .into_iter()
            .rev()
            .filter(|r| before.map_or(true, |b| r.tid < b))
            .take(limit)
            .map(|r| tables.version_info(r))
            .collect())
    }

    fn oids_in_transaction(&self, tid: Tid) -> StoreResult<Vec<Oid>> {
        self.check_online()?;
        let tables = self.inner.read();
        let mut oids: Vec<Oid> = tables
            .current
            .values()
            .filter(|r| r.tid == tid)
            .map(|r| r.oid)
            .chain(
                tables
                    .history
                    .keys()
                    .filter(|(_, t)| *t == tid)
                    .map(|(oid, _)| *oid),
            )
            .collect();
        oids.sort();
        oids.dedup();
        Ok(oids)
    }

    fn packed_before(&self) -> StoreResult<Option<Tid>> {
        self.check_online()?;
        Ok(self.inner.read().packed_before)
    }

    fn commit(&self, meta: &TransactionMeta, writes: &[ObjectWrite]) -> StoreResult<Tid> {
        self.check_online()?;
        let mut guard = self.inner.write();
        let tables = &mut *guard;

        let mut seen = HashSet::with_capacity(writes.len());
        for write in writes {
            if !seen.insert(write.oid) {
                return Err(StoreError::DuplicateWrite(write.oid));
            }
            let actual = tables.current.get(&write.oid).map(|r| r.tid);
            if actual != write.expected_tid {
                return Err(StoreError::Conflict {
                    oid: write.oid,
                    expected: write.expected_tid,
                    actual,
                });
            }
        }

        let now = Utc::now();
        let tid = Tid::next_after(tables.last_tid, now);

        for write in writes {
            if let Some(outgoing) = tables.current.remove(&write.oid) {
                if self.history_preserving {
                    tables.history.insert((outgoing.oid, outgoing.tid), outgoing);
                }
            }
            if !self.history_preserving {
                Tables::remove_range(&mut tables.blobs, write.oid, Some(tid));
            }
            if let Some(blob) = &write.blob {
                tables.blobs.insert((write.oid, tid), blob.clone());
            }
            tables.current.insert(
                write.oid,
                ObjectRecord {
                    oid: write.oid,
                    tid,
                    prev_tid: write.expected_tid,
                    state: write.state.clone(),
                    refs: write.refs.clone(),
                },
            );
            tables.next_oid = tables.next_oid.max(write.oid.get().saturating_add(1));
        }

        tables.log.insert(
            tid,
            LogEntry {
                timestamp: tid.timestamp().unwrap_or(now),
                meta: meta.clone(),
            },
        );
        tables.last_tid = Some(tid);

        debug!(%tid, objects = writes.len(), "in-memory commit");
        Ok(tid)
    }

    fn changes_since(&self, since: Tid) -> StoreResult<(Option<Tid>, Vec<Oid>)> {
        self.check_online()?;
        let tables = self.inner.read();
        let mut oids: Vec<Oid> = tables
            .current
            .values()
            .filter(|r| r.tid > since)
            .map(|r| r.oid)
            .collect();
        oids.sort();
        Ok((tables.last_tid, oids))
    }

    fn reachable_from(&self, roots: &[Oid]) -> StoreResult<HashSet<Oid>> {
        self.check_online()?;
        let tables = self.inner.read();
        let mut visited: HashSet<Oid> = HashSet::new();
        let mut queue: VecDeque<Oid> = VecDeque::new();
        for root in roots {
            if visited.insert(*root) {
                queue.push_back(*root);
            }
        }
        while let Some(current) = queue.pop_front() {
            if let Some(record) = tables.current.get(&current) {
                for target in &record.refs {
                    if visited.insert(*target) {
                        queue.push_back(*target);
                    }
                }
            }
        }
        Ok(visited)
    }

    fn oids_committed_upto(&self, snapshot: Tid) -> StoreResult<Vec<(Oid, Tid)>> {
        self.check_online()?;
        let tables = self.inner.read();
        let mut oids: Vec<(Oid, Tid)> = tables
            .current
            .values()
            .filter(|r| r.tid <= snapshot)
            .map(|r| (r.oid, r.tid))
            .collect();
        oids.sort();
        Ok(oids)
    }

    fn delete_objects(&self, oids: &[Oid], guard: Tid) -> StoreResult<SweepOutcome> {
        self.check_online()?;
        let mut tables = self.inner.write();
        if let Some(last_tid) = tables.last_tid.filter(|last| *last > guard) {
            return Ok(SweepOutcome::Stale { last_tid });
        }

        let (mut objects, mut history, mut blobs) = (0, 0, 0);
        for oid in oids {
            if tables.current.remove(oid).is_some() {
                objects += 1;
            }
            history += Tables::remove_range(&mut tables.history, *oid, None);
            blobs += Tables::remove_range(&mut tables.blobs, *oid, None);
        }
        Ok(SweepOutcome::Deleted {
            objects,
            history,
            blobs,
        })
    }

    fn prune_history(&self, boundary: Tid) -> StoreResult<PruneOutcome> {
        self.check_online()?;
        let mut guard = self.inner.write();
        let tables = &mut *guard;

        let mut history = 0;
        if self.history_preserving {
            let oids: Vec<Oid> = {
                let mut oids: Vec<Oid> = tables.history.keys().map(|(oid, _)| *oid).collect();
                oids.dedup();
                oids
            };
            for oid in oids {
                let below: Vec<Tid> = tables
                    .versions_ascending(oid)
                    .iter()
                    .map(|r| r.tid)
                    .filter(|tid| *tid < boundary)
                    .collect();
                if let Some((_, older)) = below.split_last() {
                    for tid in older {
                        if tables.history.remove(&(oid, *tid)).is_some() {
                            history += 1;
                        }
                    }
                }
            }
            tables.packed_before = tables.packed_before.max(Some(boundary));
        }

        let (blobs, transactions) = tables.cleanup();
        Ok(PruneOutcome {
            history,
            blobs,
            transactions,
        })
    }

    fn drop_history(&self) -> StoreResult<PruneOutcome> {
        self.check_online()?;
        let mut tables = self.inner.write();
        let history = tables.history.len();
        tables.history.clear();
        if self.history_preserving {
            // Every surviving version now links to a dropped predecessor.
            let boundary = tables.last_tid.map(|t| Tid::new(t.get().saturating_add(1)));
            tables.packed_before = tables.packed_before.max(boundary);
        }
        let (blobs, transactions) = tables.cleanup();
        Ok(PruneOutcome {
            history,
            blobs,
            transactions,
        })
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.inner.read();
        f.debug_struct("InMemoryObjectStore")
            .field("history_preserving", &self.history_preserving)
            .field("object_count", &tables.current.len())
            .field("history_count", &tables.history.len())
            .finish()
    }
}
