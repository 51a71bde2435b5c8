//! Configuration file support
//!
//! Loaded from `config.toml` inside the data directory (default
//! `~/.openclaw/memento/`). Every key has a default; an absent or malformed
//! file degrades to defaults with a warning rather than failing open.
//!
//! ```toml
//! [storage]
//! db_path = "/var/lib/memento/memory.db"
//!
//! [storage.backup]
//! enabled = true
//! retain = 7
//!
//! [embedding]
//! model_path = "/opt/models/all-MiniLM-L6-v2"
//! idle_timeout_ms = 1800000
//! warmup_timeout_ms = 30000
//!
//! [cache]
//! lru_size = 1000
//! bypass = false
//!
//! [query]
//! default_timeout_ms = 5000
//! filter_expansion = 3
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default data directory name under the home directory.
const DEFAULT_DATA_SUBDIR: &str = ".openclaw/memento";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file; defaults to `<data_dir>/memory.db`.
    pub db_path: Option<PathBuf>,
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    /// Rotated snapshots to keep.
    pub retain: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retain: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Directory with the ONNX export; `None` fetches from HuggingFace Hub.
    pub model_path: Option<PathBuf>,
    pub idle_timeout_ms: u64,
    pub warmup_timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            idle_timeout_ms: 1_800_000,
            warmup_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub lru_size: usize,
    pub bypass: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lru_size: 1000,
            bypass: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_timeout_ms: u64,
    /// Candidate expansion factor under active filters (max 10).
    pub filter_expansion: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: crate::query::DEFAULT_TIMEOUT_MS,
            filter_expansion: crate::query::DEFAULT_FILTER_EXPANSION,
        }
    }
}

impl Config {
    /// Load `config.toml` from `data_dir` (or the default data directory).
    pub fn load(data_dir: Option<&Path>) -> Self {
        let dir = data_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(default_data_dir);
        let mut config = Self::load_file(&dir.join("config.toml")).unwrap_or_default();
        // Anchor relative defaults to the directory the config came from
        if config.storage.db_path.is_none() {
            config.storage.db_path = Some(dir.join("memory.db"));
        }
        config
    }

    /// Load configuration from a specific file
    fn load_file(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", path.display(), e);
                return None;
            }
        };

        match toml::from_str::<Self>(&content) {
            Ok(config) => {
                tracing::debug!(
                    path = %path.display(),
                    db_path = ?config.storage.db_path,
                    backup_enabled = config.storage.backup.enabled,
                    lru_size = config.cache.lru_size,
                    default_timeout_ms = config.query.default_timeout_ms,
                    "Loaded config"
                );
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Resolved database path.
    pub fn db_path(&self) -> PathBuf {
        self.storage
            .db_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("memory.db"))
    }

    /// Directory holding the database, cache, and backups.
    pub fn data_dir(&self) -> PathBuf {
        self.db_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(default_data_dir)
    }

    /// Expansion factor clamped to the documented maximum.
    pub fn filter_expansion(&self) -> u32 {
        self.query.filter_expansion.clamp(1, 10)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_DATA_SUBDIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.storage.backup.enabled);
        assert_eq!(config.storage.backup.retain, 7);
        assert_eq!(config.embedding.idle_timeout_ms, 1_800_000);
        assert_eq!(config.embedding.warmup_timeout_ms, 30_000);
        assert_eq!(config.cache.lru_size, 1000);
        assert!(!config.cache.bypass);
        assert_eq!(config.query.default_timeout_ms, 5_000);
        assert_eq!(config.query.filter_expansion, 3);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(Some(dir.path()));
        assert_eq!(config.db_path(), dir.path().join("memory.db"));
        assert_eq!(config.data_dir(), dir.path());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[cache]\nlru_size = 50\n\n[query]\nfilter_expansion = 99\n",
        )
        .unwrap();
        let config = Config::load(Some(dir.path()));
        assert_eq!(config.cache.lru_size, 50);
        // Unspecified keys keep defaults
        assert_eq!(config.query.default_timeout_ms, 5_000);
        // Out-of-range expansion is clamped at the accessor
        assert_eq!(config.filter_expansion(), 10);
    }

    #[test]
    fn test_malformed_file_degrades_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "not [valid toml").unwrap();
        let config = Config::load(Some(dir.path()));
        assert_eq!(config.cache.lru_size, 1000);
    }
}
