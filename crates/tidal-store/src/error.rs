use tidal_types::{Oid, Tid};

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic-concurrency check failed: the object's current tid is not
    /// the one the writer expected.
    #[error("conflict on {oid}: expected {expected:?}, found {actual:?}")]
    Conflict {
        oid: Oid,
        expected: Option<Tid>,
        actual: Option<Tid>,
    },

    /// The requested object (or version) does not exist.
    #[error("object not found: {0}")]
    NotFound(Oid),

    /// The backend is unreachable, busy, or the connection pool is exhausted.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored invariant does not hold. Never repaired automatically.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// The same object was written twice in one commit.
    #[error("duplicate write for {0} in one transaction")]
    DuplicateWrite(Oid),

    /// Serialization or deserialization of stored columns failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The database was created in the other storage mode.
    #[error("database is {}, opened as {}", mode_name(.stored), mode_name(.requested))]
    ModeMismatch { stored: bool, requested: bool },

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                ) =>
            {
                StoreError::Unavailable(err.to_string())
            }
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DatabaseCorrupt => {
                StoreError::Corruption(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

fn mode_name(history_preserving: &bool) -> &'static str {
    if *history_preserving {
        "history-preserving"
    } else {
        "history-free"
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
