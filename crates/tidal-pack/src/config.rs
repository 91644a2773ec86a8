use serde::{Deserialize, Serialize};

/// Which unreachable objects a history-preserving pack may delete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Every unreachable object is deleted with all of its history.
    #[default]
    None,
    /// Unreachable objects last written at or after the pack boundary are
    /// kept until a later pack.
    KeepAfterBoundary,
}

/// Pack collector configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Objects deleted per backend transaction.
    pub batch_size: usize,
    pub retention: RetentionPolicy,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            retention: RetentionPolicy::default(),
        }
    }
}
