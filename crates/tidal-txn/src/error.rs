use tidal_store::StoreError;
use tidal_types::{Oid, Tid};

/// Errors produced by transactions and history operations.
#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("conflict on {oid}: expected {expected:?}, found {actual:?}")]
    Conflict {
        oid: Oid,
        expected: Option<Tid>,
        actual: Option<Tid>,
    },

    #[error("cannot undo {tid} for {oid}: {reason}")]
    UndoConflict { oid: Oid, tid: Tid, reason: String },

    #[error("transaction cancelled")]
    Cancelled,

    #[error("transaction exceeded its timeout of {timeout_ms} ms")]
    TimedOut { timeout_ms: u64 },

    #[error("cannot {operation} a transaction in state {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl TxnError {
    /// Whether the error is an optimistic-concurrency conflict, whichever
    /// layer detected it.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TxnError::Conflict { .. }
                | TxnError::UndoConflict { .. }
                | TxnError::Store(StoreError::Conflict { .. })
        )
    }
}

/// Result alias for transaction operations.
pub type TxnResult<T> = Result<T, TxnError>;
