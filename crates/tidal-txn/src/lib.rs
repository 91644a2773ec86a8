//! Transactions and history for Tidal.
//!
//! This crate owns the write path on top of an [`ObjectStore`](tidal_store::ObjectStore):
//! - [`Coordinator`] / [`Transaction`] -- two-phase commit with a grouped
//!   validation pass, timeouts, and cooperative cancellation
//! - [`TxnState`] -- the explicit `Open -> Voting -> Committed | Aborted`
//!   state machine
//! - [`HistoryManager`] -- chain-verified history listings, undo, and
//!   history removal

pub mod coordinator;
pub mod error;
pub mod history;
pub mod state;

pub use coordinator::{Coordinator, Transaction};
pub use error::{TxnError, TxnResult};
pub use history::HistoryManager;
pub use state::{AbortReason, TxnState};
