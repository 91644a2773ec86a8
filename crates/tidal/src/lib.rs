//! Tidal: transactional object storage.
//!
//! Persists a graph of objects (opaque state plus declared references) into
//! a relational backing store, with atomic multi-object commits,
//! point-in-time history, and reachability-based packing.
//!
//! This crate is the embedding entry point. It wires the lower crates
//! together behind [`Storage`]:
//!
//! - `tidal-store`: object records, history, blobs; in-memory and SQLite
//!   backends
//! - `tidal-cache`: the process-local LRU read cache
//! - `tidal-txn`: two-phase commit, history listing, and undo
//! - `tidal-pack`: mark-and-sweep garbage collection
//!
//! Library code logs through `tracing` and never installs a subscriber.

pub mod codec;
pub mod config;
pub mod error;
pub mod storage;

pub use codec::{Codec, CodecError, Encoded, JsonCodec, References};
pub use config::{BackendConfig, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use storage::{Revision, Storage, StorageTransaction, StoreRequest};

pub use tidal_cache::CacheStats;
pub use tidal_pack::{PackConfig, PackReport, RetentionPolicy};
pub use tidal_txn::TxnState;
pub use tidal_types::{CancelToken, ObjectWrite, Oid, Tid, TransactionMeta, VersionInfo};
