//! Foundation types for Tidal.
//!
//! Tidal persists an object graph into a relational backing store. This crate
//! provides the identifiers and record shapes every other Tidal crate shares.
//!
//! # Key Types
//!
//! - [`Oid`]: stable object identifier; [`Oid::ROOT`] anchors reachability
//! - [`Tid`]: monotonic transaction identifier encoding the commit time
//! - [`ObjectRecord`]: one stored version of an object (state + refs)
//! - [`ObjectWrite`]: a staged write carrying its optimistic-concurrency check
//! - [`TransactionMeta`]: user/description/extension attached to a commit
//! - [`VersionInfo`]: one entry of an object's history listing
//! - [`CancelToken`]: cooperative cancellation for transactions and pack

pub mod cancel;
pub mod error;
pub mod oid;
pub mod record;
pub mod tid;

pub use cancel::CancelToken;
pub use error::TypeError;
pub use oid::Oid;
pub use record::{LoadedBefore, ObjectRecord, ObjectWrite, TransactionMeta, VersionInfo};
pub use tid::Tid;
