use std::fmt;

use serde::{Deserialize, Serialize};

use tidal_types::Tid;

/// Why a transaction ended without committing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The caller aborted explicitly.
    Requested,
    /// A staged write's expected tid no longer matched.
    Conflict,
    Cancelled,
    TimedOut,
    /// The backend failed during validation or commit.
    StoreFailure,
}

/// Two-phase commit state.
///
/// `Open -> Voting -> Committed`, `Open -> Voting -> Aborted`, or
/// `Open -> Aborted`. Both terminal states are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Open,
    Voting,
    Committed(Tid),
    Aborted(AbortReason),
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed(_) | TxnState::Aborted(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxnState::Open => "open",
            TxnState::Voting => "voting",
            TxnState::Committed(_) => "committed",
            TxnState::Aborted(_) => "aborted",
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Committed(tid) => write!(f, "committed at {tid}"),
            TxnState::Aborted(reason) => write!(f, "aborted ({reason:?})"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TxnState::Open.is_terminal());
        assert!(!TxnState::Voting.is_terminal());
        assert!(TxnState::Committed(Tid::new(1)).is_terminal());
        assert!(TxnState::Aborted(AbortReason::Conflict).is_terminal());
    }

    #[test]
    fn display() {
        assert_eq!(TxnState::Voting.to_string(), "voting");
        assert_eq!(TxnState::Committed(Tid::new(7)).to_string(), "committed at 7");
        assert_eq!(
            TxnState::Aborted(AbortReason::TimedOut).to_string(),
            "aborted (TimedOut)"
        );
    }
}
