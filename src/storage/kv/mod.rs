//! Key-value storage backend.
//!
//! Readers always work on one immutable generation of the tables. A writer
//! copies the current generation, applies its whole batch to the copy and
//! publishes it with a single pointer swap, so a reader never observes a
//! half-applied reload.
//!
//! In durable mode each batch is appended to a write-ahead log before it is
//! published, and the log is periodically folded into a snapshot:
//!
//! ```text
//!  writer ──► copy of current generation ──► apply batch
//!                                               │ ok
//!                                               ▼
//!                                   WriteAheadLog::append
//!                                               │
//!                                               ▼
//!                         swap Arc<KvTables>  ──►  readers
//!                                               │ WAL too large
//!                                               ▼
//!                          snapshot (tmp + rename) ──► WAL truncate
//! ```
//!
//! A durable store holds an exclusive lock on its directory while open.
//! [`KvStore::connect_read_only`] skips the lock: it replays the snapshot and
//! WAL as they stand, never compacts, and refuses every write.

mod codec;
mod snapshot;
mod tables;
mod wal;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::NormalizerError;
use crate::gene::{ConceptId, GeneRecord};
use crate::merged::MergedConcept;
use crate::source::{SourceMeta, SourceName};
use crate::storage::file_lock::FileLock;
use crate::storage::traits::{BackendKind, JobSlot, LookupField, RecordStore, StorageError};

use tables::KvTables;
use wal::{WalEntryKind, WriteAheadLog};

const LOCK_FILE: &str = "store.lock";
const WAL_FILE: &str = "store.wal";
const MERGE_LOCK_FILE: &str = "merge.lock";

/// Attempts a read-only load makes while a writer compacts underneath it.
const READ_ONLY_ATTEMPTS: usize = 5;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    StorageError::Backend(format!("{context}: {e}"))
}

/// Configuration for a durable key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvConfig {
    /// WAL size that triggers compaction into a snapshot (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every batch.
    pub sync_on_write: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl KvConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Checks bounds.
    ///
    /// # Errors
    /// Returns a configuration error if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, NormalizerError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(NormalizerError::config(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }
        Ok(self)
    }
}

struct Durability {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    config: KvConfig,
}

impl Durability {
    fn compact(&self, tables: &KvTables) -> Result<(), StorageError> {
        let up_to = self
            .wal
            .current_sequence()
            .map_err(|e| io_err("failed to read WAL sequence", &e))?;
        let path = snapshot::write(&self.dir, up_to, &tables.to_snapshot())
            .map_err(|e| io_err("failed to write snapshot", &e))?;
        self.wal
            .truncate()
            .map_err(|e| io_err("failed to truncate WAL", &e))?;
        tracing::info!(up_to_sequence = up_to, path = %path.display(), "compacted key-value WAL");
        Ok(())
    }
}

/// Key-value [`RecordStore`], in-memory or durable.
pub struct KvStore {
    current: RwLock<Arc<KvTables>>,
    writer: Mutex<Option<Durability>>,
    dir: Option<PathBuf>,
    read_only: bool,
    merge_slot: JobSlot,
}

impl KvStore {
    /// Creates an empty in-memory store with its schema initialized.
    #[must_use]
    pub fn open_in_memory() -> Self {
        Self::from_parts(KvTables::initialized(), None)
    }

    /// Creates an empty in-memory store without a schema.
    #[must_use]
    pub fn connect_in_memory() -> Self {
        Self::from_parts(KvTables::default(), None)
    }

    /// Opens or creates a durable store in `dir` and initializes its schema.
    ///
    /// # Errors
    /// - `Connection` if the directory cannot be created or is locked by another process
    /// - `Backend` if the snapshot or WAL cannot be read
    pub fn open(dir: impl AsRef<Path>, config: KvConfig) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            StorageError::Connection(format!("failed to create store directory {}: {e}", dir.display()))
        })?;
        let store = Self::load(dir, config)?;
        store.initialize_schema()?;
        Ok(store)
    }

    /// Opens an existing durable store without creating anything.
    ///
    /// # Errors
    /// - `Connection` if `dir` does not exist or is locked by another process
    pub fn connect(dir: impl AsRef<Path>, config: KvConfig) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(StorageError::Connection(format!(
                "store directory {} does not exist",
                dir.display()
            )));
        }
        Self::load(dir, config)
    }

    /// Loads the durable store in `dir` as it stands, for inspection only.
    ///
    /// Takes no directory lock, so it works next to a running writer. The
    /// store shows the last generation committed before the call and
    /// refuses every write with `ReadOnly`.
    ///
    /// # Errors
    /// - `Connection` if `dir` does not exist or never settles while a
    ///   writer keeps compacting
    /// - `Backend` if the snapshot or WAL cannot be read
    pub fn connect_read_only(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(StorageError::Connection(format!(
                "store directory {} does not exist",
                dir.display()
            )));
        }

        for attempt in 1..=READ_ONLY_ATTEMPTS {
            let before = snapshot::read_header(dir).map_err(|e| io_err("failed to read snapshot", &e))?;
            let loaded = Self::replay(dir, None);
            let after = snapshot::read_header(dir).map_err(|e| io_err("failed to read snapshot", &e))?;
            match loaded {
                // a compaction in between may have truncated entries we never saw
                Ok((tables, replayed)) if before == after => {
                    tracing::info!(dir = %dir.display(), replayed, "opened key-value store read-only");
                    let mut store = Self::from_parts(tables, None);
                    store.dir = Some(dir.to_path_buf());
                    store.read_only = true;
                    return Ok(store);
                }
                Ok(_) => tracing::debug!(attempt, "snapshot replaced during read-only load, retrying"),
                // a WAL caught mid-truncation has no header yet
                Err(e) if attempt < READ_ONLY_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "read-only load failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::Connection(format!(
            "store {} kept changing during read-only load",
            dir.display()
        )))
    }

    fn from_parts(tables: KvTables, durability: Option<Durability>) -> Self {
        Self {
            current: RwLock::new(Arc::new(tables)),
            dir: durability.as_ref().map(|d| d.dir.clone()),
            writer: Mutex::new(durability),
            read_only: false,
            merge_slot: JobSlot::default(),
        }
    }

    /// Rebuilds the tables from the snapshot and the WAL behind it.
    ///
    /// With `wal` the entries come from the open log; without, the log file
    /// is read directly and a missing one counts as empty.
    fn replay(dir: &Path, wal: Option<&WriteAheadLog>) -> Result<(KvTables, usize), StorageError> {
        let (base_sequence, mut tables) = match snapshot::read(dir)
            .map_err(|e| io_err("failed to read snapshot", &e))?
        {
            Some((header, data)) => (header.up_to_sequence, KvTables::from_snapshot(data)),
            None => (0, KvTables::default()),
        };

        let entries = match wal {
            Some(wal) => wal.iter(),
            None => {
                let path = dir.join(WAL_FILE);
                if !path.exists() {
                    return Ok((tables, 0));
                }
                wal::read_only_iter(&path)
            }
        }
        .map_err(|e| io_err("failed to iterate WAL", &e))?;

        let mut replayed = 0usize;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, replayed, "stopping WAL replay at corrupt entry");
                    break;
                }
            };
            if entry.sequence <= base_sequence {
                continue;
            }
            tables.apply(&entry.kind).map_err(|e| {
                StorageError::Backend(format!(
                    "failed to replay WAL entry {} ({}): {e}",
                    entry.sequence,
                    entry.kind.label()
                ))
            })?;
            replayed += 1;
        }
        Ok((tables, replayed))
    }

    fn load(dir: &Path, config: KvConfig) -> Result<Self, StorageError> {
        let lock = FileLock::acquire(dir, LOCK_FILE)
            .map_err(|e| StorageError::Connection(format!("failed to acquire store lock: {e}")))?;

        let stale = snapshot::remove_stale_temp_files(dir)
            .map_err(|e| io_err("failed to clean snapshot temp files", &e))?;
        if stale > 0 {
            tracing::warn!(count = stale, "removed interrupted snapshot files");
        }

        let base_sequence = snapshot::read_header(dir)
            .map_err(|e| io_err("failed to read snapshot", &e))?
            .map_or(0, |header| header.up_to_sequence);
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write, base_sequence)
            .map_err(|e| io_err("failed to open WAL", &e))?;
        let (tables, replayed) = Self::replay(dir, Some(&wal))?;

        let durability = Durability {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            config,
        };
        // Fold whatever was replayed (and any torn tail) into a fresh snapshot.
        if durability
            .wal
            .has_entries()
            .map_err(|e| io_err("failed to stat WAL", &e))?
        {
            durability.compact(&tables)?;
        }
        tracing::info!(dir = %dir.display(), replayed, "opened key-value store");

        Ok(Self::from_parts(tables, Some(durability)))
    }

    /// Current generation of the tables.
    fn tables(&self) -> Result<Arc<KvTables>, StorageError> {
        Ok(Arc::clone(&*self.current.read().map_err(|_| lock_err("kv.current"))?))
    }

    fn initialized_tables(&self) -> Result<Arc<KvTables>, StorageError> {
        let tables = self.tables()?;
        if tables.schema_initialized() {
            Ok(tables)
        } else {
            Err(StorageError::SchemaUninitialized)
        }
    }

    /// Applies `op` to a copy of the current generation, logs it and publishes it.
    fn commit(&self, op: WalEntryKind) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let durability = self.writer.lock().map_err(|_| lock_err("kv.writer"))?;

        let mut next = (*self.tables()?).clone();
        next.apply(&op)?;

        let label = op.label();
        if let Some(d) = durability.as_ref() {
            d.wal
                .append(op)
                .map_err(|e| io_err("failed to append to WAL", &e))?;
        }

        let next = Arc::new(next);
        *self.current.write().map_err(|_| lock_err("kv.current"))? = Arc::clone(&next);
        tracing::debug!(op = label, "published key-value generation");

        if let Some(d) = durability.as_ref() {
            let wal_size = d.wal.size_bytes().map_err(|e| io_err("failed to stat WAL", &e))?;
            if wal_size > d.config.max_wal_size {
                // The batch is already durable in the WAL; a failed compaction is retried next write.
                if let Err(e) = d.compact(&next) {
                    tracing::warn!(error = %e, "key-value compaction failed");
                }
            }
        }
        Ok(())
    }
}

impl RecordStore for KvStore {
    fn backend(&self) -> BackendKind {
        BackendKind::KeyValue
    }

    fn merge_slot(&self) -> &JobSlot {
        &self.merge_slot
    }

    fn merge_lock_file(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(MERGE_LOCK_FILE))
    }

    fn initialize_schema(&self) -> Result<(), StorageError> {
        if self.tables()?.schema_initialized() {
            return Ok(());
        }
        self.commit(WalEntryKind::InitializeSchema)
    }

    fn check_schema_initialized(&self) -> Result<bool, StorageError> {
        Ok(self.tables()?.schema_initialized())
    }

    fn drop_schema(&self) -> Result<(), StorageError> {
        self.commit(WalEntryKind::DropSchema)?;
        tracing::warn!("dropped key-value tables");
        Ok(())
    }

    fn records_generation(&self) -> Result<u64, StorageError> {
        Ok(self.initialized_tables()?.records_generation())
    }

    fn check_tables_populated(&self) -> Result<bool, StorageError> {
        let tables = self.tables()?;
        Ok(tables.schema_initialized() && tables.populated())
    }

    fn put_records(&self, source: SourceName, records: Vec<GeneRecord>) -> Result<(), StorageError> {
        let count = records.len();
        self.commit(WalEntryKind::ReplaceSource {
            source,
            records,
            meta: None,
        })?;
        tracing::info!(%source, count, "replaced source records");
        Ok(())
    }

    fn put_source(&self, source: SourceName, records: Vec<GeneRecord>, meta: SourceMeta) -> Result<(), StorageError> {
        let count = records.len();
        self.commit(WalEntryKind::ReplaceSource {
            source,
            records,
            meta: Some(meta),
        })?;
        tracing::info!(%source, count, "replaced source records and metadata");
        Ok(())
    }

    fn put_merged(&self, concepts: Vec<MergedConcept>) -> Result<(), StorageError> {
        let count = concepts.len();
        self.commit(WalEntryKind::ReplaceMerged {
            concepts,
            expected_generation: None,
        })?;
        tracing::info!(count, "replaced merged concepts");
        Ok(())
    }

    fn put_merged_at(&self, generation: u64, concepts: Vec<MergedConcept>) -> Result<(), StorageError> {
        let count = concepts.len();
        self.commit(WalEntryKind::ReplaceMerged {
            concepts,
            expected_generation: Some(generation),
        })?;
        tracing::info!(count, generation, "replaced merged concepts");
        Ok(())
    }

    fn put_source_metadata(&self, source: SourceName, meta: SourceMeta) -> Result<(), StorageError> {
        self.commit(WalEntryKind::PutMetadata { source, meta })
    }

    fn get_source_metadata(&self, source: SourceName) -> Result<Option<SourceMeta>, StorageError> {
        Ok(self.initialized_tables()?.metadata(source).cloned())
    }

    fn get_by_concept_id(&self, concept_id: &str) -> Result<Option<GeneRecord>, StorageError> {
        Ok(self.initialized_tables()?.record(concept_id).cloned())
    }

    fn get_merged(&self, concept_id: &str) -> Result<Option<MergedConcept>, StorageError> {
        Ok(self.initialized_tables()?.merged(concept_id).cloned())
    }

    fn find_by_field(&self, field: LookupField, value: &str) -> Result<Vec<ConceptId>, StorageError> {
        Ok(self.initialized_tables()?.find(field, value))
    }

    fn scan_records(&self) -> Result<Vec<GeneRecord>, StorageError> {
        Ok(self.initialized_tables()?.records())
    }

    fn scan_merged(&self) -> Result<Vec<MergedConcept>, StorageError> {
        Ok(self.initialized_tables()?.merged_concepts())
    }

    fn all_concept_ids(&self) -> Result<Vec<ConceptId>, StorageError> {
        Ok(self.initialized_tables()?.concept_ids())
    }

    fn delete_source(&self, source: SourceName) -> Result<(), StorageError> {
        self.commit(WalEntryKind::DeleteSource { source })?;
        tracing::info!(%source, "deleted source");
        Ok(())
    }

    fn delete_merged(&self) -> Result<(), StorageError> {
        self.commit(WalEntryKind::DeleteMerged)
    }
}
