use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use tidal_cache::{CacheStats, Invalidator, LocalCache};
use tidal_pack::{PackCollector, PackReport};
use tidal_store::{InMemoryObjectStore, ObjectStore, SqliteObjectStore};
use tidal_txn::{Coordinator, HistoryManager, Transaction, TxnState};
use tidal_types::{CancelToken, ObjectWrite, Oid, Tid, TransactionMeta, VersionInfo};

use crate::codec::Codec;
use crate::config::{BackendConfig, StorageConfig};
use crate::error::{StorageError, StorageResult};

/// Changed-object count above which `sync` drops the whole cache instead of
/// invalidating entry by entry.
const SYNC_CLEAR_THRESHOLD: usize = 10_000;

/// One object to write in a batch store.
#[derive(Clone, Debug)]
pub struct StoreRequest<T> {
    pub oid: Oid,
    /// Tid the caller last saw; `None` for a new object.
    pub expected_tid: Option<Tid>,
    pub object: T,
    pub blob: Option<Vec<u8>>,
}

impl<T> StoreRequest<T> {
    pub fn new(oid: Oid, expected_tid: Option<Tid>, object: T) -> Self {
        Self {
            oid,
            expected_tid,
            object,
            blob: None,
        }
    }

    pub fn with_blob(mut self, blob: Vec<u8>) -> Self {
        self.blob = Some(blob);
        self
    }
}

/// A decoded point-in-time read.
#[derive(Clone, Debug, PartialEq)]
pub struct Revision<T> {
    pub object: T,
    pub start_tid: Tid,
    /// Tid of the version that replaced this one; `None` if still current.
    pub end_tid: Option<Tid>,
}

/// Transactional object storage over a pluggable backend.
///
/// Reads go through a process-local cache that is invalidated on every
/// commit made through this instance. Commits made by other processes become
/// visible to cached reads after [`sync`](Storage::sync).
pub struct Storage<C: Codec> {
    name: String,
    codec: C,
    store: Arc<dyn ObjectStore>,
    cache: Arc<LocalCache<C::Object>>,
    coordinator: Coordinator,
    history: HistoryManager,
    collector: PackCollector,
    synced: Mutex<Option<Tid>>,
}

impl<C: Codec> Storage<C> {
    /// Build the configured backend and open storage over it.
    pub fn open(config: &StorageConfig, codec: C) -> StorageResult<Self> {
        config.validate()?;
        let store: Arc<dyn ObjectStore> = match &config.backend {
            BackendConfig::Memory => Arc::new(InMemoryObjectStore::new(config.history_preserving)),
            BackendConfig::Sqlite { path } => Arc::new(SqliteObjectStore::open(
                path,
                config.history_preserving,
                config.pool_config(),
            )?),
        };
        Self::with_store(store, codec, config)
    }

    /// Open storage over an existing backend.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        codec: C,
        config: &StorageConfig,
    ) -> StorageResult<Self> {
        config.validate()?;
        if store.history_preserving() != config.history_preserving {
            return Err(StorageError::Config(format!(
                "backend history_preserving={} but configuration requests {}",
                store.history_preserving(),
                config.history_preserving
            )));
        }

        let cache = Arc::new(LocalCache::new(config.cache_budget_bytes()));
        let invalidator: Arc<dyn Invalidator> = cache.clone();
        let coordinator = Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&invalidator),
            config.transaction_timeout(),
        );
        let history = HistoryManager::new(coordinator.clone());
        let collector =
            PackCollector::new(Arc::clone(&store), invalidator, config.pack.clone());
        let synced = store.last_tid()?;

        info!(
            name = %config.name,
            history_preserving = config.history_preserving,
            cache_bytes = config.cache_budget_bytes(),
            "storage opened"
        );
        Ok(Self {
            name: config.name.clone(),
            codec,
            store,
            cache,
            coordinator,
            history,
            collector,
            synced: Mutex::new(synced),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn history_preserving(&self) -> bool {
        self.store.history_preserving()
    }

    /// Allocate a fresh object id.
    pub fn new_oid(&self) -> StorageResult<Oid> {
        Ok(self.store.new_oid()?)
    }

    /// Tid of the most recent commit, or `None` for an empty store.
    pub fn last_tid(&self) -> StorageResult<Option<Tid>> {
        Ok(self.store.last_tid()?)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The current version of `oid` and its tid.
    pub fn load(&self, oid: Oid) -> StorageResult<(C::Object, Tid)> {
        if let Some((tid, object)) = self.cache.get(oid) {
            return Ok((object, tid));
        }
        let ticket = self.cache.ticket();
        let record = self.store.load(oid)?.ok_or(StorageError::NotFound(oid))?;
        let object = self.codec.decode(&record.state)?;
        self.cache
            .put_if_fresh(oid, record.tid, object.clone(), record.size(), ticket);
        Ok((object, record.tid))
    }

    /// Load several objects; missing ones come back as `None`.
    ///
    /// Cache misses are fetched from the backend in one grouped request.
    pub fn load_many(&self, oids: &[Oid]) -> StorageResult<Vec<Option<(C::Object, Tid)>>> {
        let mut results: Vec<Option<(C::Object, Tid)>> = Vec::with_capacity(oids.len());
        let mut missing = Vec::new();
        let mut missing_at = Vec::new();
        for (idx, oid) in oids.iter().enumerate() {
            match self.cache.get(*oid) {
                Some((tid, object)) => results.push(Some((object, tid))),
                None => {
                    results.push(None);
                    missing.push(*oid);
                    missing_at.push(idx);
                }
            }
        }
        if missing.is_empty() {
            return Ok(results);
        }

        let ticket = self.cache.ticket();
        let records = self.store.load_many(&missing)?;
        for (idx, record) in missing_at.into_iter().zip(records) {
            if let Some(record) = record {
                let object = self.codec.decode(&record.state)?;
                self.cache
                    .put_if_fresh(record.oid, record.tid, object.clone(), record.size(), ticket);
                results[idx] = Some((object, record.tid));
            }
        }
        Ok(results)
    }

    /// The version of `oid` that was current strictly before `tid`.
    pub fn load_before(&self, oid: Oid, tid: Tid) -> StorageResult<Revision<C::Object>> {
        let loaded = self
            .store
            .load_before(oid, tid)?
            .ok_or(StorageError::NotFound(oid))?;
        Ok(Revision {
            object: self.codec.decode(&loaded.record.state)?,
            start_tid: loaded.start_tid(),
            end_tid: loaded.end_tid,
        })
    }

    /// The blob stored with version `tid` of `oid`.
    pub fn load_blob(&self, oid: Oid, tid: Tid) -> StorageResult<Vec<u8>> {
        self.store
            .load_blob(oid, tid)?
            .ok_or(StorageError::NotFound(oid))
    }

    /// Up to `limit` versions of `oid`, newest first.
    pub fn history(&self, oid: Oid, limit: usize) -> StorageResult<Vec<VersionInfo>> {
        Ok(self.history.history(oid, limit)?)
    }

    /// Up to `limit` versions of `oid` older than `before`, newest first.
    pub fn history_before(
        &self,
        oid: Oid,
        before: Tid,
        limit: usize,
    ) -> StorageResult<Vec<VersionInfo>> {
        Ok(self.history.history_before(oid, before, limit)?)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Open an explicit transaction.
    pub fn begin(&self) -> StorageTransaction<'_, C> {
        self.begin_with(TransactionMeta::default(), CancelToken::new())
    }

    pub fn begin_with(
        &self,
        meta: TransactionMeta,
        cancel: CancelToken,
    ) -> StorageTransaction<'_, C> {
        StorageTransaction {
            storage: self,
            txn: self.coordinator.begin_with(meta, cancel),
        }
    }

    /// Encode and commit a batch atomically. Returns the commit tid.
    pub fn store(
        &self,
        requests: &[StoreRequest<C::Object>],
        meta: TransactionMeta,
    ) -> StorageResult<Tid> {
        let mut txn = self.begin_with(meta, CancelToken::new());
        for request in requests {
            txn.stage_request(request)?;
        }
        txn.commit()
    }

    /// Commit pre-encoded writes without going through the codec.
    pub fn store_raw(
        &self,
        writes: Vec<ObjectWrite>,
        meta: TransactionMeta,
    ) -> StorageResult<Tid> {
        let mut txn = self.begin_with(meta, CancelToken::new());
        for write in writes {
            txn.stage_raw(write)?;
        }
        txn.commit()
    }

    /// Revert the objects written by `tid` as a new commit.
    pub fn undo(&self, tid: Tid, meta: TransactionMeta) -> StorageResult<Tid> {
        Ok(self.history.undo(tid, meta)?)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Remove unreachable objects and history older than `before`.
    pub fn pack(&self, before: DateTime<Utc>) -> StorageResult<PackReport> {
        self.pack_with_cancel(before, &CancelToken::new())
    }

    pub fn pack_with_cancel(
        &self,
        before: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> StorageResult<PackReport> {
        let boundary = Tid::from_datetime(before);
        debug!(storage = %self.name, %boundary, "pack requested");
        Ok(self.collector.pack(boundary, cancel)?)
    }

    /// Invalidate cached objects that other writers changed since the last
    /// sync. Returns the number of changed objects seen.
    ///
    /// Deletions made by another process's pack are not reported.
    pub fn sync(&self) -> StorageResult<usize> {
        let mut synced = self.synced.lock();
        let since = synced.unwrap_or(Tid::ZERO);
        let (last, changed) = self.store.changes_since(since)?;
        if changed.len() > SYNC_CLEAR_THRESHOLD {
            self.cache.clear();
            debug!(
                storage = %self.name,
                %since,
                changed = changed.len(),
                "sync overflow, cache cleared"
            );
        } else if !changed.is_empty() {
            self.cache.invalidate(&changed);
            debug!(storage = %self.name, %since, changed = changed.len(), "synced cache");
        }
        if last > *synced {
            *synced = last;
        }
        Ok(changed.len())
    }

    /// Discard all archived versions. Returns the number removed.
    pub fn drop_history(&self) -> StorageResult<usize> {
        let removed = self.history.drop_history()?.history;
        self.cache.clear();
        Ok(removed)
    }
}

impl<C: Codec> std::fmt::Debug for Storage<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.name)
            .field("coordinator", &self.coordinator)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// An open transaction on a [`Storage`].
///
/// Dropping it without committing discards the staged writes.
pub struct StorageTransaction<'a, C: Codec> {
    storage: &'a Storage<C>,
    txn: Transaction,
}

impl<'a, C: Codec> StorageTransaction<'a, C> {
    pub fn state(&self) -> TxnState {
        self.txn.state()
    }

    pub fn set_meta(&mut self, meta: TransactionMeta) {
        self.txn.set_meta(meta);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.txn.set_timeout(timeout);
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.txn.cancel_token()
    }

    /// Encode and stage `object` for `oid`.
    pub fn stage(
        &mut self,
        oid: Oid,
        expected_tid: Option<Tid>,
        object: &C::Object,
    ) -> StorageResult<()> {
        let encoded = self.storage.codec.encode(object)?;
        self.stage_raw(ObjectWrite::new(oid, expected_tid, encoded.state, encoded.refs))
    }

    pub fn stage_request(&mut self, request: &StoreRequest<C::Object>) -> StorageResult<()> {
        let encoded = self.storage.codec.encode(&request.object)?;
        let mut write =
            ObjectWrite::new(request.oid, request.expected_tid, encoded.state, encoded.refs);
        if let Some(blob) = &request.blob {
            write = write.with_blob(blob.clone());
        }
        self.stage_raw(write)
    }

    pub fn stage_raw(&mut self, write: ObjectWrite) -> StorageResult<()> {
        Ok(self.txn.stage(write)?)
    }

    pub fn commit(self) -> StorageResult<Tid> {
        Ok(self.txn.commit()?)
    }

    pub fn abort(mut self) -> StorageResult<()> {
        Ok(self.txn.abort()?)
    }
}
