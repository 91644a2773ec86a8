use thiserror::Error;
use tidal_store::StoreError;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("a pack is already running")]
    AlreadyRunning,

    #[error("pack cancelled after removing {objects_removed} objects")]
    Cancelled { objects_removed: usize },

    #[error("sweep gave up after {attempts} re-marks under concurrent commits")]
    Contended { attempts: usize },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type PackResult<T> = Result<T, PackError>;
