//! Process-local object cache for Tidal.
//!
//! [`LocalCache`] maps object ids to the most recently loaded decoded state
//! and the tid it was loaded at. It is bounded by a byte budget and evicts in
//! strict least-recently-used order. Commits invalidate touched ids through
//! the [`Invalidator`] seam so a cached entry never outlives the version it
//! was filled from.

pub mod cache;
pub mod stats;

pub use cache::{FillTicket, Invalidator, LocalCache};
pub use stats::CacheStats;
