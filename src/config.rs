//! Runtime configuration.
//!
//! A store is selected by URL:
//!
//! | URL                | Backend                              |
//! |--------------------|--------------------------------------|
//! | `kv::memory:`      | in-memory key-value store            |
//! | `kv://<dir>`       | durable key-value store in `<dir>`   |
//! | `sqlite::memory:`  | private in-memory SQLite database    |
//! | `sqlite://<file>`  | SQLite database file                 |
//!
//! [`NormalizerConfig::from_env`] reads `GENE_NORM_DB_URL`,
//! `GENE_NORM_SOURCE_PRIORITY` (comma-separated source names, highest
//! first) and `GENE_NORM_MERGE_LOCK_DIR`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{NormalizerError, NormalizerResult};
use crate::merge::MergeEngine;
use crate::query::QueryHandler;
use crate::source::SourcePriority;
use crate::storage::{KvConfig, KvStore, RecordStore, SqliteConfig, SqliteStore};

/// Environment variable holding the store URL.
pub const DB_URL_ENV: &str = "GENE_NORM_DB_URL";
/// Environment variable holding the source priority list.
pub const SOURCE_PRIORITY_ENV: &str = "GENE_NORM_SOURCE_PRIORITY";
/// Environment variable naming the merge lock directory.
pub const MERGE_LOCK_DIR_ENV: &str = "GENE_NORM_MERGE_LOCK_DIR";

/// Which backend to use, and where.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreConfig {
    /// `kv::memory:`
    #[default]
    KvMemory,
    /// `kv://<dir>`
    KvDir(PathBuf),
    /// `sqlite::memory:`
    SqliteMemory,
    /// `sqlite://<file>`
    SqliteFile(PathBuf),
}

impl FromStr for StoreConfig {
    type Err = NormalizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = s.trim();
        let parsed = match url {
            "kv::memory:" => Some(Self::KvMemory),
            "sqlite::memory:" => Some(Self::SqliteMemory),
            _ => {
                if let Some(dir) = url.strip_prefix("kv://").filter(|p| !p.is_empty()) {
                    Some(Self::KvDir(PathBuf::from(dir)))
                } else {
                    url.strip_prefix("sqlite://")
                        .filter(|p| !p.is_empty())
                        .map(|file| Self::SqliteFile(PathBuf::from(file)))
                }
            }
        };
        parsed.ok_or_else(|| NormalizerError::config(format!("unrecognized database URL '{url}'")))
    }
}

impl fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KvMemory => f.write_str("kv::memory:"),
            Self::KvDir(dir) => write!(f, "kv://{}", dir.display()),
            Self::SqliteMemory => f.write_str("sqlite::memory:"),
            Self::SqliteFile(file) => write!(f, "sqlite://{}", file.display()),
        }
    }
}

/// Everything needed to assemble a normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizerConfig {
    /// Backend and location.
    pub store: StoreConfig,
    /// Merge and tie-break order.
    pub priority: SourcePriority,
    /// Directory for the cross-process merge lock. When unset, file-backed
    /// stores keep it beside their own files.
    pub merge_lock_dir: Option<PathBuf>,
    /// Durable key-value store tuning.
    pub kv: KvConfig,
    /// SQLite tuning.
    pub sqlite: SqliteConfig,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl NormalizerConfig {
    /// Defaults overridden by whichever environment variables are set.
    ///
    /// # Errors
    /// `Config` or `Validation` if a variable does not parse.
    pub fn from_env() -> NormalizerResult<Self> {
        let mut config = Self::default();
        if let Some(url) = env_var(DB_URL_ENV) {
            config.store = url.parse()?;
        }
        if let Some(order) = env_var(SOURCE_PRIORITY_ENV) {
            config.priority = order.parse()?;
        }
        config.merge_lock_dir = env_var(MERGE_LOCK_DIR_ENV).map(PathBuf::from);
        config.validate()
    }

    /// Checks backend settings and the lock directory.
    ///
    /// # Errors
    /// `Config` if a bound is violated or the lock directory does not exist.
    pub fn validate(self) -> NormalizerResult<Self> {
        let kv = self.kv.validate()?;
        let sqlite = self.sqlite.validate()?;
        if let Some(dir) = &self.merge_lock_dir {
            if !dir.is_dir() {
                return Err(NormalizerError::config(format!(
                    "merge lock directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(Self { kv, sqlite, ..self })
    }

    /// Opens the configured store, creating it and its schema if needed.
    ///
    /// # Errors
    /// `Storage` if the backend cannot be opened.
    pub fn open_store(&self) -> NormalizerResult<Arc<dyn RecordStore>> {
        let store: Arc<dyn RecordStore> = match &self.store {
            StoreConfig::KvMemory => Arc::new(KvStore::open_in_memory()),
            StoreConfig::KvDir(dir) => Arc::new(KvStore::open(dir, self.kv.clone())?),
            StoreConfig::SqliteMemory => Arc::new(SqliteStore::open_in_memory()?),
            StoreConfig::SqliteFile(file) => Arc::new(SqliteStore::open(file, self.sqlite.clone())?),
        };
        tracing::info!(url = %self.store, "store opened");
        Ok(store)
    }

    /// Opens an existing store without creating anything.
    ///
    /// # Errors
    /// `Storage(Connection)` if the store does not exist.
    pub fn connect_store(&self) -> NormalizerResult<Arc<dyn RecordStore>> {
        let store: Arc<dyn RecordStore> = match &self.store {
            StoreConfig::KvMemory => Arc::new(KvStore::connect_in_memory()),
            StoreConfig::KvDir(dir) => Arc::new(KvStore::connect(dir, self.kv.clone())?),
            StoreConfig::SqliteMemory => Arc::new(SqliteStore::connect_in_memory()?),
            StoreConfig::SqliteFile(file) => Arc::new(SqliteStore::connect(file, self.sqlite.clone())?),
        };
        Ok(store)
    }

    /// Opens an existing store for reading only.
    ///
    /// A durable key-value store is loaded without its directory lock, so
    /// this works while another process holds the store open for writing.
    /// The other backends connect as [`NormalizerConfig::connect_store`]
    /// does.
    ///
    /// # Errors
    /// `Storage(Connection)` if the store does not exist.
    pub fn inspect_store(&self) -> NormalizerResult<Arc<dyn RecordStore>> {
        match &self.store {
            StoreConfig::KvDir(dir) => Ok(Arc::new(KvStore::connect_read_only(dir)?)),
            _ => self.connect_store(),
        }
    }

    /// Merge engine using the configured priority and lock directory.
    #[must_use]
    pub fn merge_engine(&self) -> MergeEngine {
        match &self.merge_lock_dir {
            Some(dir) => MergeEngine::with_lock_dir(self.priority.clone(), dir.clone()),
            None => MergeEngine::new(self.priority.clone()),
        }
    }

    /// Query handler over `store` using the configured priority.
    #[must_use]
    pub fn query_handler(&self, store: Arc<dyn RecordStore>) -> QueryHandler {
        QueryHandler::new(store, self.priority.clone())
    }
}
