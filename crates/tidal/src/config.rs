use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tidal_pack::PackConfig;
use tidal_store::PoolConfig;

use crate::error::{StorageError, StorageResult};

/// Storage settings, loadable from TOML. Every field has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub name: String,
    pub history_preserving: bool,
    /// Local cache budget in megabytes; 0 disables the cache.
    pub cache_local_mb: usize,
    /// Connections opened when the storage is created.
    pub pool_size: usize,
    pub pool_max_size: usize,
    /// How long a caller waits for a pooled connection.
    pub pool_timeout_ms: u64,
    /// Default transaction timeout; `None` means no timeout.
    pub transaction_timeout_ms: Option<u64>,
    pub backend: BackendConfig,
    pub pack: PackConfig,
}

/// Where object records live.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            name: "tidal".into(),
            history_preserving: false,
            cache_local_mb: 16,
            pool_size: 1,
            pool_max_size: 10,
            pool_timeout_ms: 30_000,
            transaction_timeout_ms: None,
            backend: BackendConfig::default(),
            pack: PackConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> StorageResult<Self> {
        let config: StorageConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.pool_max_size == 0 {
            return Err(StorageError::Config("pool_max_size must be at least 1".into()));
        }
        if self.pool_size > self.pool_max_size {
            return Err(StorageError::Config(format!(
                "pool_size {} exceeds pool_max_size {}",
                self.pool_size, self.pool_max_size
            )));
        }
        if self.pack.batch_size == 0 {
            return Err(StorageError::Config("pack.batch_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.pool_size,
            max_size: self.pool_max_size,
            wait_timeout: Duration::from_millis(self.pool_timeout_ms),
        }
    }

    pub fn cache_budget_bytes(&self) -> usize {
        self.cache_local_mb.saturating_mul(1024 * 1024)
    }

    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.transaction_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use tidal_pack::RetentionPolicy;

    use super::*;

    #[test]
    fn defaults_mirror_storage_factory() {
        let config = StorageConfig::default();
        assert_eq!(config.name, "tidal");
        assert!(!config.history_preserving);
        assert_eq!(config.cache_local_mb, 16);
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.pool_max_size, 10);
        assert_eq!(config.backend, BackendConfig::Memory);
        assert_eq!(config.cache_budget_bytes(), 16 * 1024 * 1024);
        assert!(config.transaction_timeout().is_none());
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(StorageConfig::from_toml_str("").unwrap(), StorageConfig::default());
    }

    #[test]
    fn parses_full_document() {
        let config = StorageConfig::from_toml_str(
            r#"
            name = "cms"
            history_preserving = true
            cache_local_mb = 0
            pool_size = 2
            pool_max_size = 4
            pool_timeout_ms = 500
            transaction_timeout_ms = 10000

            [backend]
            kind = "sqlite"
            path = "/var/lib/tidal/cms.db"

            [pack]
            batch_size = 100
            retention = "keep-after-boundary"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "cms");
        assert!(config.history_preserving);
        assert_eq!(
            config.backend,
            BackendConfig::Sqlite {
                path: "/var/lib/tidal/cms.db".into()
            }
        );
        assert_eq!(config.pack.retention, RetentionPolicy::KeepAfterBoundary);
        assert_eq!(config.pool_config().wait_timeout, Duration::from_millis(500));
        assert_eq!(config.transaction_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn invalid_pool_bounds_rejected() {
        let err = StorageConfig::from_toml_str("pool_size = 5\npool_max_size = 2").unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(matches!(
            StorageConfig::from_toml_str("pool_size = \"many\""),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidal.toml");
        std::fs::write(&path, "name = \"from-file\"").unwrap();
        assert_eq!(StorageConfig::from_file(&path).unwrap().name, "from-file");
        assert!(StorageConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
