use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use tidal_types::{Oid, Tid};

use crate::stats::CacheStats;

/// Removes cache entries for objects touched by a commit or a pack.
pub trait Invalidator: Send + Sync {
    fn invalidate(&self, oids: &[Oid]);

    /// Drop every entry.
    fn invalidate_all(&self);
}

/// Proof that a reader asked for a fill before going to the store.
///
/// A fill presented with a ticket older than the latest invalidation is
/// dropped, since the loaded version may already be superseded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillTicket(u64);

struct Entry<V> {
    tid: Tid,
    value: V,
    size: usize,
    tick: u64,
}

struct CacheInner<V> {
    entries: HashMap<Oid, Entry<V>>,
    /// Access order: smallest tick is least recently used.
    order: BTreeMap<u64, Oid>,
    resident: usize,
    clock: u64,
    generation: u64,
}

impl<V> CacheInner<V> {
    fn touch(&mut self, oid: Oid) {
        self.clock += 1;
        let tick = self.clock;
        if let Some(entry) = self.entries.get_mut(&oid) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, oid);
        }
    }

    fn remove(&mut self, oid: &Oid) -> bool {
        match self.entries.remove(oid) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                self.resident -= entry.size;
                true
            }
            None => false,
        }
    }

    fn evict_lru(&mut self) -> Option<Oid> {
        let (_, oid) = self.order.pop_first()?;
        if let Some(entry) = self.entries.remove(&oid) {
            self.resident -= entry.size;
        }
        Some(oid)
    }
}

/// Bounded LRU cache of decoded object state.
///
/// All lookup, insert, LRU-touch, and eviction work happens under a single
/// lock. A budget of zero disables caching entirely.
pub struct LocalCache<V> {
    budget: usize,
    inner: Mutex<CacheInner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    stale_fills: AtomicU64,
}

impl<V: Clone> LocalCache<V> {
    /// Create a cache holding at most `budget` bytes of state.
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                resident: 0,
                clock: 0,
                generation: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            stale_fills: AtomicU64::new(0),
        }
    }

    /// Create a cache with a budget given in megabytes.
    pub fn with_megabytes(mb: usize) -> Self {
        Self::new(mb.saturating_mul(1024 * 1024))
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn is_enabled(&self) -> bool {
        self.budget > 0
    }

    /// Look up an object, marking it most recently used on a hit.
    pub fn get(&self, oid: Oid) -> Option<(Tid, V)> {
        let mut inner = self.inner.lock();
        let found = inner
            .entries
            .get(&oid)
            .map(|entry| (entry.tid, entry.value.clone()));
        match found {
            Some(hit) => {
                inner.touch(oid);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(hit)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Take a ticket before loading from the store.
    pub fn ticket(&self) -> FillTicket {
        FillTicket(self.inner.lock().generation)
    }

    /// Insert or replace an entry unconditionally.
    pub fn put(&self, oid: Oid, tid: Tid, value: V, size: usize) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, oid, tid, value, size);
    }

    /// Insert an entry loaded under `ticket`, unless an invalidation happened
    /// since the ticket was taken. Returns whether the entry was stored.
    pub fn put_if_fresh(
        &self,
        oid: Oid,
        tid: Tid,
        value: V,
        size: usize,
        ticket: FillTicket,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != ticket.0 {
            self.stale_fills.fetch_add(1, Ordering::Relaxed);
            debug!(%oid, %tid, "dropping fill that raced an invalidation");
            return false;
        }
        self.insert_locked(&mut inner, oid, tid, value, size)
    }

    fn insert_locked(
        &self,
        inner: &mut CacheInner<V>,
        oid: Oid,
        tid: Tid,
        value: V,
        size: usize,
    ) -> bool {
        if size > self.budget {
            return false;
        }
        if inner.entries.get(&oid).is_some_and(|e| e.tid > tid) {
            return false;
        }
        inner.remove(&oid);

        inner.clock += 1;
        let tick = inner.clock;
        inner.entries.insert(
            oid,
            Entry {
                tid,
                value,
                size,
                tick,
            },
        );
        inner.order.insert(tick, oid);
        inner.resident += size;
        self.inserts.fetch_add(1, Ordering::Relaxed);

        self.evict_locked(inner);
        true
    }

    fn evict_locked(&self, inner: &mut CacheInner<V>) -> usize {
        let mut evicted = 0;
        while inner.resident > self.budget {
            match inner.evict_lru() {
                Some(oid) => {
                    debug!(%oid, resident = inner.resident, "evicted cache entry");
                    evicted += 1;
                }
                None => break,
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Evict least-recently-used entries until resident bytes fit the
    /// budget. Returns the number of entries evicted.
    pub fn evict_to_budget(&self) -> usize {
        let mut inner = self.inner.lock();
        self.evict_locked(&mut inner)
    }

    /// Remove the given objects. Any fill ticket issued before this call
    /// becomes stale.
    pub fn invalidate(&self, oids: &[Oid]) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let mut removed = 0u64;
        for oid in oids {
            if inner.remove(oid) {
                removed += 1;
            }
        }
        self.invalidations.fetch_add(removed, Ordering::Relaxed);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let removed = inner.entries.len() as u64;
        inner.entries.clear();
        inner.order.clear();
        inner.resident = 0;
        self.invalidations.fetch_add(removed, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.inner.lock().entries.contains_key(&oid)
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner.lock().resident
    }

    /// Snapshot of cache statistics.
    pub fn stats(&self) -> CacheStats {
        let (resident, entries) = {
            let inner = self.inner.lock();
            (inner.resident, inner.entries.len())
        };
        CacheStats {
            budget_bytes: self.budget,
            resident_bytes: resident,
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            stale_fills: self.stale_fills.load(Ordering::Relaxed),
        }
    }
}

impl<V: Clone + Send> Invalidator for LocalCache<V> {
    fn invalidate(&self, oids: &[Oid]) {
        LocalCache::invalidate(self, oids);
    }

    fn invalidate_all(&self) {
        self.clear();
    }
}

impl<V> std::fmt::Debug for LocalCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LocalCache")
            .field("budget", &self.budget)
            .field("resident", &inner.resident)
            .field("entries", &inner.entries.len())
            .finish()
    }
}
