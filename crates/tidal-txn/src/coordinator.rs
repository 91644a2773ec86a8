use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use tidal_cache::Invalidator;
use tidal_store::{ObjectStore, StoreError};
use tidal_types::{CancelToken, ObjectWrite, Oid, Tid, TransactionMeta};

use crate::error::{TxnError, TxnResult};
use crate::state::{AbortReason, TxnState};

/// Owns the write path: opens transactions against a shared store and
/// invalidates the process cache for every committed write.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn ObjectStore>,
    invalidator: Arc<dyn Invalidator>,
    timeout: Option<Duration>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        invalidator: Arc<dyn Invalidator>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            invalidator,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn invalidator(&self) -> &Arc<dyn Invalidator> {
        &self.invalidator
    }

    /// Open a transaction with empty metadata and the default timeout.
    pub fn begin(&self) -> Transaction {
        self.begin_with(TransactionMeta::default(), CancelToken::new())
    }

    /// Open a transaction with the given metadata and cancellation token.
    pub fn begin_with(&self, meta: TransactionMeta, cancel: CancelToken) -> Transaction {
        Transaction {
            coordinator: self.clone(),
            meta,
            writes: Vec::new(),
            positions: HashMap::new(),
            state: TxnState::Open,
            deadline: self.timeout.map(|t| Instant::now() + t),
            timeout: self.timeout,
            cancel,
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("history_preserving", &self.store.history_preserving())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A batch of staged writes committed atomically under one tid.
///
/// Nothing is visible to other readers until [`finish_commit`] succeeds. A
/// transaction that is dropped while open simply discards its writes.
///
/// [`finish_commit`]: Transaction::finish_commit
pub struct Transaction {
    coordinator: Coordinator,
    meta: TransactionMeta,
    writes: Vec<ObjectWrite>,
    positions: HashMap<Oid, usize>,
    state: TxnState,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    cancel: CancelToken,
}

impl Transaction {
    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn meta(&self) -> &TransactionMeta {
        &self.meta
    }

    pub fn set_meta(&mut self, meta: TransactionMeta) {
        self.meta = meta;
    }

    /// Override the coordinator's default timeout, measured from now.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
        self.deadline = Some(Instant::now() + timeout);
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn staged(&self) -> &[ObjectWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Stage a write. Staging the same object again replaces the earlier
    /// write.
    pub fn stage(&mut self, write: ObjectWrite) -> TxnResult<()> {
        self.require(TxnState::Open, "stage")?;
        match self.positions.get(&write.oid) {
            Some(&idx) => self.writes[idx] = write,
            None => {
                self.positions.insert(write.oid, self.writes.len());
                self.writes.push(write);
            }
        }
        Ok(())
    }

    /// Phase one: validate every staged expected tid against the store in a
    /// single grouped request. Any mismatch aborts the whole transaction.
    pub fn begin_commit(&mut self) -> TxnResult<()> {
        self.require(TxnState::Open, "vote on")?;
        self.check_live()?;
        self.state = TxnState::Voting;

        let store = Arc::clone(&self.coordinator.store);
        let oids: Vec<Oid> = self.writes.iter().map(|w| w.oid).collect();
        let current = match store.current_tids(&oids) {
            Ok(current) => current,
            Err(err) => return Err(self.fail(err)),
        };

        for write in &self.writes {
            let actual = current.get(&write.oid).copied();
            if actual != write.expected_tid {
                warn!(
                    oid = %write.oid,
                    expected = ?write.expected_tid,
                    ?actual,
                    "validation conflict"
                );
                let err = TxnError::Conflict {
                    oid: write.oid,
                    expected: write.expected_tid,
                    actual,
                };
                self.state = TxnState::Aborted(AbortReason::Conflict);
                return Err(err);
            }
        }
        debug!(objects = self.writes.len(), "transaction validated");
        Ok(())
    }

    /// Phase two: apply the batch in one backend transaction and invalidate
    /// cached entries for every touched object.
    ///
    /// An empty transaction writes nothing and returns the last committed
    /// tid ([`Tid::ZERO`] for an empty store).
    pub fn finish_commit(&mut self) -> TxnResult<Tid> {
        self.require(TxnState::Voting, "commit")?;
        self.check_live()?;

        let store = Arc::clone(&self.coordinator.store);
        if self.writes.is_empty() {
            let tid = match store.last_tid() {
                Ok(tid) => tid.unwrap_or(Tid::ZERO),
                Err(err) => return Err(self.fail(err)),
            };
            self.state = TxnState::Committed(tid);
            return Ok(tid);
        }

        match store.commit(&self.meta, &self.writes) {
            Ok(tid) => {
                let touched: Vec<Oid> = self.writes.iter().map(|w| w.oid).collect();
                self.coordinator.invalidator.invalidate(&touched);
                self.state = TxnState::Committed(tid);
                debug!(%tid, objects = touched.len(), "transaction committed");
                Ok(tid)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Run both phases.
    pub fn commit(mut self) -> TxnResult<Tid> {
        self.begin_commit()?;
        self.finish_commit()
    }

    /// Abort an open or voting transaction. Nothing was written.
    pub fn abort(&mut self) -> TxnResult<()> {
        if self.state.is_terminal() {
            return Err(TxnError::InvalidState {
                state: self.state.name(),
                operation: "abort",
            });
        }
        self.state = TxnState::Aborted(AbortReason::Requested);
        Ok(())
    }

    fn require(&self, expected: TxnState, operation: &'static str) -> TxnResult<()> {
        if self.state != expected {
            return Err(TxnError::InvalidState {
                state: self.state.name(),
                operation,
            });
        }
        Ok(())
    }

    fn check_live(&mut self) -> TxnResult<()> {
        if self.cancel.is_cancelled() {
            self.state = TxnState::Aborted(AbortReason::Cancelled);
            return Err(TxnError::Cancelled);
        }
        if let (Some(deadline), Some(timeout)) = (self.deadline, self.timeout) {
            if Instant::now() >= deadline {
                self.state = TxnState::Aborted(AbortReason::TimedOut);
                return Err(TxnError::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Record an abort caused by a store error and translate conflicts.
    fn fail(&mut self, err: StoreError) -> TxnError {
        match err {
            StoreError::Conflict {
                oid,
                expected,
                actual,
            } => {
                warn!(%oid, ?expected, ?actual, "commit conflict");
                self.state = TxnState::Aborted(AbortReason::Conflict);
                TxnError::Conflict {
                    oid,
                    expected,
                    actual,
                }
            }
            other => {
                warn!(error = %other, "transaction aborted by store failure");
                self.state = TxnState::Aborted(AbortReason::StoreFailure);
                TxnError::Store(other)
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("writes", &self.writes.len())
            .field("user", &self.meta.user)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;

    use tidal_store::InMemoryObjectStore;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Oid>>);

    impl Invalidator for Recorder {
        fn invalidate(&self, oids: &[Oid]) {
            self.0.lock().unwrap().extend_from_slice(oids);
        }

        fn invalidate_all(&self) {
            self.0.lock().unwrap().clear();
        }
    }

    fn setup(history_preserving: bool) -> (Arc<InMemoryObjectStore>, Arc<Recorder>, Coordinator) {
        let store = Arc::new(InMemoryObjectStore::new(history_preserving));
        let recorder = Arc::new(Recorder::default());
        let coordinator = Coordinator::new(store.clone(), recorder.clone(), None);
        (store, recorder, coordinator)
    }

    fn write(oid: u64, expected: Option<Tid>, state: &[u8]) -> ObjectWrite {
        ObjectWrite::new(Oid::new(oid), expected, state.to_vec(), [])
    }

    // -----------------------------------------------------------------------
    // Happy path
    // -----------------------------------------------------------------------

    #[test]
    fn commit_applies_batch_and_invalidates() {
        let (store, recorder, coordinator) = setup(false);
        let mut txn = coordinator.begin();
        txn.stage(write(1, None, b"a")).unwrap();
        txn.stage(write(2, None, b"b")).unwrap();
        let tid = txn.commit().unwrap();

        assert_eq!(store.load(Oid::new(1)).unwrap().unwrap().tid, tid);
        assert_eq!(store.load(Oid::new(2)).unwrap().unwrap().tid, tid);
        assert_eq!(*recorder.0.lock().unwrap(), vec![Oid::new(1), Oid::new(2)]);
    }

    #[test]
    fn restaging_replaces_earlier_write() {
        let (store, _, coordinator) = setup(false);
        let mut txn = coordinator.begin();
        txn.stage(write(1, None, b"first")).unwrap();
        txn.stage(write(1, None, b"second")).unwrap();
        assert_eq!(txn.staged().len(), 1);
        txn.commit().unwrap();
        assert_eq!(store.load(Oid::new(1)).unwrap().unwrap().state, b"second");
    }

    #[test]
    fn empty_transaction_returns_last_tid() {
        let (store, _, coordinator) = setup(false);
        assert_eq!(coordinator.begin().commit().unwrap(), Tid::ZERO);

        let mut txn = coordinator.begin();
        txn.stage(write(1, None, b"a")).unwrap();
        let tid = txn.commit().unwrap();

        assert_eq!(coordinator.begin().commit().unwrap(), tid);
        assert_eq!(store.transaction_count(), 1);
    }

    #[test]
    fn metadata_reaches_the_log() {
        let (store, _, coordinator) = setup(true);
        let mut txn = coordinator.begin_with(TransactionMeta::new("ops", "seed"), CancelToken::new());
        txn.stage(write(1, None, b"a")).unwrap();
        txn.commit().unwrap();
        let listing = store.versions(Oid::new(1), None, 1).unwrap();
        assert_eq!(listing[0].user, "ops");
        assert_eq!(listing[0].description, "seed");
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    #[test]
    fn two_phase_transitions() {
        let (_, _, coordinator) = setup(false);
        let mut txn = coordinator.begin();
        txn.stage(write(1, None, b"a")).unwrap();
        assert_eq!(txn.state(), TxnState::Open);
        txn.begin_commit().unwrap();
        assert_eq!(txn.state(), TxnState::Voting);
        assert!(matches!(
            txn.stage(write(2, None, b"b")),
            Err(TxnError::InvalidState { .. })
        ));
        let tid = txn.finish_commit().unwrap();
        assert_eq!(txn.state(), TxnState::Committed(tid));
        assert!(txn.abort().is_err());
    }

    #[test]
    fn finish_requires_vote() {
        let (_, _, coordinator) = setup(false);
        let mut txn = coordinator.begin();
        assert!(matches!(
            txn.finish_commit(),
            Err(TxnError::InvalidState { state: "open", .. })
        ));
    }

    #[test]
    fn abort_discards_writes() {
        let (store, recorder, coordinator) = setup(false);
        let mut txn = coordinator.begin();
        txn.stage(write(1, None, b"a")).unwrap();
        txn.abort().unwrap();
        assert_eq!(txn.state(), TxnState::Aborted(AbortReason::Requested));
        assert!(txn.begin_commit().is_err());
        assert!(store.is_empty());
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Failure paths
    // -----------------------------------------------------------------------

    #[test]
    fn stale_expectation_aborts_in_validation() {
        let (store, recorder, coordinator) = setup(false);
        let mut first = coordinator.begin();
        first.stage(write(1, None, b"a")).unwrap();
        let t1 = first.commit().unwrap();
        recorder.0.lock().unwrap().clear();

        let mut txn = coordinator.begin();
        txn.stage(write(2, None, b"b")).unwrap();
        txn.stage(write(1, Some(Tid::new(t1.get() - 1)), b"x")).unwrap();
        let err = txn.begin_commit().unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(txn.state(), TxnState::Aborted(AbortReason::Conflict));
        assert!(store.load(Oid::new(2)).unwrap().is_none());
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn race_between_phases_is_caught_by_store() {
        let (store, _, coordinator) = setup(false);
        let mut txn = coordinator.begin();
        txn.stage(write(1, None, b"mine")).unwrap();
        txn.begin_commit().unwrap();

        // Another writer creates the object after validation.
        let mut other = coordinator.begin();
        other.stage(write(1, None, b"theirs")).unwrap();
        other.commit().unwrap();

        let err = txn.finish_commit().unwrap_err();
        assert!(matches!(err, TxnError::Conflict { .. }));
        assert_eq!(txn.state(), TxnState::Aborted(AbortReason::Conflict));
        assert_eq!(store.load(Oid::new(1)).unwrap().unwrap().state, b"theirs");
    }

    #[test]
    fn cancelled_before_vote() {
        let (store, _, coordinator) = setup(false);
        let cancel = CancelToken::new();
        let mut txn = coordinator.begin_with(TransactionMeta::default(), cancel.clone());
        txn.stage(write(1, None, b"a")).unwrap();
        cancel.cancel();
        assert!(matches!(txn.begin_commit(), Err(TxnError::Cancelled)));
        assert_eq!(txn.state(), TxnState::Aborted(AbortReason::Cancelled));
        assert!(store.is_empty());
    }

    #[test]
    fn cancelled_between_phases() {
        let (store, _, coordinator) = setup(false);
        let mut txn = coordinator.begin();
        txn.stage(write(1, None, b"a")).unwrap();
        txn.begin_commit().unwrap();
        txn.cancel_token().cancel();
        assert!(matches!(txn.finish_commit(), Err(TxnError::Cancelled)));
        assert!(store.is_empty());
    }

    #[test]
    fn expired_transaction_times_out() {
        let (store, _, coordinator) = setup(false);
        let mut txn = coordinator.begin();
        txn.set_timeout(Duration::ZERO);
        txn.stage(write(1, None, b"a")).unwrap();
        assert!(matches!(
            txn.begin_commit(),
            Err(TxnError::TimedOut { timeout_ms: 0 })
        ));
        assert_eq!(txn.state(), TxnState::Aborted(AbortReason::TimedOut));
        assert!(store.is_empty());
    }

    #[test]
    fn store_outage_aborts_cleanly() {
        let (store, _, coordinator) = setup(false);
        let mut txn = coordinator.begin();
        txn.stage(write(1, None, b"a")).unwrap();
        store.set_offline(true);
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, TxnError::Store(StoreError::Unavailable(_))));
        store.set_offline(false);
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_writers_one_winner() {
        let (store, _, coordinator) = setup(false);
        let mut seed = coordinator.begin();
        seed.stage(write(1, None, b"base")).unwrap();
        let base = seed.commit().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let coordinator = coordinator.clone();
                thread::spawn(move || {
                    let mut txn = coordinator.begin();
                    txn.stage(write(1, Some(base), format!("w{i}").as_bytes()))?;
                    txn.commit()
                })
            })
            .collect();
        let results: Vec<TxnResult<Tid>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<Tid> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(TxnError::is_conflict));
        assert_eq!(store.load(Oid::new(1)).unwrap().unwrap().tid, winners[0]);
    }
}
