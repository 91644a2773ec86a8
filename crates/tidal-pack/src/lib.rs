//! Pack collector for Tidal.
//!
//! Packing removes objects that are no longer reachable from the root object
//! and, in history-preserving mode, prunes archived versions older than a
//! boundary tid.
//!
//! # Protocol
//!
//! - **Mark**: record the last committed tid as the snapshot, compute the set
//!   reachable from [`Oid::ROOT`](tidal_types::Oid::ROOT) over stored refs, and
//!   collect every object committed at or before the snapshot that is not in
//!   it.
//! - **Sweep**: delete candidates in batches, each in its own backend
//!   transaction guarded by a tid. A commit after the guard makes the batch
//!   stale; the collector then rescues everything reachable from the objects
//!   that changed and retries.
//! - **Prune**: drop history older than the boundary (keeping the newest
//!   version before it), then blobs and log rows nothing refers to.

pub mod collector;
pub mod config;
pub mod error;

pub use collector::{Marked, PackCollector, PackReport};
pub use config::{PackConfig, RetentionPolicy};
pub use error::{PackError, PackResult};
