use thiserror::Error;

use tidal_pack::PackError;
use tidal_store::StoreError;
use tidal_txn::TxnError;
use tidal_types::Oid;

use crate::codec::CodecError;

/// Errors surfaced by [`Storage`](crate::Storage).
#[derive(Debug, Error)]
pub enum StorageError {
    /// An optimistic-concurrency check failed. Retry with fresh state.
    #[error("conflict on {oid}: {detail}")]
    Conflict { oid: Oid, detail: String },

    #[error("object not found: {0}")]
    NotFound(Oid),

    /// The backend is unreachable, busy, or out of connections.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A stored invariant does not hold. The operation stops; nothing is
    /// repaired.
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Conflict { .. } | StorageError::StorageUnavailable(_)
        )
    }
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                oid,
                expected,
                actual,
            } => StorageError::Conflict {
                oid,
                detail: format!("expected {expected:?}, found {actual:?}"),
            },
            StoreError::NotFound(oid) => StorageError::NotFound(oid),
            StoreError::Unavailable(msg) | StoreError::Backend(msg) => {
                StorageError::StorageUnavailable(msg)
            }
            StoreError::Io(e) => StorageError::StorageUnavailable(e.to_string()),
            StoreError::Corruption(msg) | StoreError::Serialization(msg) => {
                StorageError::Corruption(msg)
            }
            StoreError::DuplicateWrite(oid) => {
                StorageError::InvalidOperation(format!("{oid} written twice in one transaction"))
            }
            e @ StoreError::ModeMismatch { .. } => StorageError::Config(e.to_string()),
        }
    }
}

impl From<TxnError> for StorageError {
    fn from(err: TxnError) -> Self {
        match err {
            TxnError::Conflict {
                oid,
                expected,
                actual,
            } => StorageError::Conflict {
                oid,
                detail: format!("expected {expected:?}, found {actual:?}"),
            },
            TxnError::UndoConflict { oid, tid, reason } => StorageError::Conflict {
                oid,
                detail: format!("cannot undo {tid}: {reason}"),
            },
            TxnError::Cancelled => StorageError::Cancelled("transaction cancelled".into()),
            e @ TxnError::TimedOut { .. } => StorageError::Cancelled(e.to_string()),
            e @ TxnError::InvalidState { .. } => StorageError::InvalidOperation(e.to_string()),
            TxnError::InvalidOperation(msg) => StorageError::InvalidOperation(msg),
            TxnError::Store(e) => e.into(),
        }
    }
}

impl From<PackError> for StorageError {
    fn from(err: PackError) -> Self {
        match err {
            e @ (PackError::AlreadyRunning | PackError::Contended { .. }) => {
                StorageError::StorageUnavailable(e.to_string())
            }
            e @ PackError::Cancelled { .. } => StorageError::Cancelled(e.to_string()),
            PackError::Store(e) => e.into(),
        }
    }
}

impl From<toml::de::Error> for StorageError {
    fn from(err: toml::de::Error) -> Self {
        StorageError::Config(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
