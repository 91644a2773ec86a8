use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(String),
}
