//! Object storage for Tidal.
//!
//! Objects are opaque byte states keyed by [`Oid`](tidal_types::Oid). Each
//! committed version carries the [`Tid`](tidal_types::Tid) of the transaction
//! that wrote it, a link to the version it superseded, and the set of oids it
//! references. The store keeps one current row per object and, in
//! history-preserving mode, an archive of every superseded version.
//!
//! # Storage Backends
//!
//! All backends implement the [`ObjectStore`] trait:
//!
//! - [`InMemoryObjectStore`] -- lock-protected maps for tests and embedding
//! - [`SqliteObjectStore`] -- relational tables in a SQLite file, accessed
//!   through a bounded [`Pool`]
//!
//! # Design Rules
//!
//! 1. A commit validates every expected tid and applies all of its writes
//!    inside one atomic section.
//! 2. Archive-then-overwrite: the outgoing version is copied to history
//!    before the current row changes.
//! 3. Tids are strictly increasing across commits.
//! 4. The store never interprets object state. Pack reads only `refs`.
//! 5. Sweeps are guarded by a tid so that a concurrent commit makes them
//!    back off instead of deleting newly referenced objects.

pub mod error;
pub mod memory;
pub mod pool;
pub mod schema;
pub mod sqlite;
pub mod traits;
pub mod versions;

// Re-export primary types at crate root for ergonomic imports.
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryObjectStore;
pub use pool::{ConnectionFactory, Pool, PoolConfig, PooledConnection};
pub use sqlite::{SqliteConnector, SqliteObjectStore};
pub use traits::{ObjectStore, PruneOutcome, SweepOutcome};
pub use versions::{resolve_before, verify_chain};
