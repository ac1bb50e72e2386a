//! Abstract storage contract for gene records.
//!
//! Both backends implement [`RecordStore`] with identical observable
//! semantics, and the same contract suite runs against each of them. The
//! contract:
//! - Per-source replaces and full merged-table replaces are atomic: a reader
//!   sees either the previous generation or the new one, never a mixture.
//! - A failed replace leaves the previous generation intact and readable.
//! - Lookups are case-insensitive exact matches and return concept IDs in
//!   ascending order.
//! - `merge_ref` is owned by the store. It is cleared on every per-source
//!   replace and set for every member by [`RecordStore::put_merged`].
//! - Every change to the record set bumps the records generation. A merged
//!   table computed from an older generation is refused by
//!   [`RecordStore::put_merged_at`].

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, TryLockError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gene::{ConceptId, GeneRecord};
use crate::merged::MergedConcept;
use crate::source::{SourceMeta, SourceName};

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The backend could not be reached. Fatal to the caller.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A constraint was violated; the whole write was rolled back.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The backend failed in an unexpected way.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The schema has not been created yet.
    #[error("Schema is not initialized")]
    SchemaUninitialized,

    /// The store was opened for inspection only.
    #[error("Store is open read-only")]
    ReadOnly,

    /// The records changed after the caller read them.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl StorageError {
    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Conflict(_))
    }
}

/// Single-flight slot for store-wide jobs.
///
/// Each store owns one, so every caller sharing the store contends on the
/// same slot no matter which engine instance it came through.
#[derive(Debug, Default)]
pub struct JobSlot(Mutex<()>);

/// Occupies a [`JobSlot`] until dropped.
#[derive(Debug)]
pub struct JobGuard<'a>(MutexGuard<'a, ()>);

impl JobSlot {
    /// Occupies the slot, or returns `None` if a job already holds it.
    pub fn try_enter(&self) -> Option<JobGuard<'_>> {
        match self.0.try_lock() {
            Ok(guard) => Some(JobGuard(guard)),
            Err(TryLockError::WouldBlock) => None,
            // a job that panicked left nothing half-written behind the slot
            Err(TryLockError::Poisoned(poisoned)) => Some(JobGuard(poisoned.into_inner())),
        }
    }
}

/// Record fields with a case-insensitive lookup index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupField {
    /// `symbol`
    Symbol,
    /// Each of `previous_symbols`
    PreviousSymbol,
    /// Each of `aliases`
    Alias,
    /// Each of `xrefs`
    Xref,
    /// Each of `associated_with`
    AssociatedWith,
}

impl LookupField {
    /// Every indexed field, in match-tier order.
    pub const ALL: [LookupField; 5] = [
        LookupField::Symbol,
        LookupField::PreviousSymbol,
        LookupField::Alias,
        LookupField::Xref,
        LookupField::AssociatedWith,
    ];

    /// Item type tag used in lookup keys.
    #[must_use]
    pub const fn item_type(self) -> &'static str {
        match self {
            Self::Symbol => "symbol",
            Self::PreviousSymbol => "prev_symbol",
            Self::Alias => "alias",
            Self::Xref => "xref",
            Self::AssociatedWith => "associated_with",
        }
    }
}

impl fmt::Display for LookupField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.item_type())
    }
}

/// Identifies which backend implementation a store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// [`KvStore`](super::KvStore)
    KeyValue,
    /// [`SqliteStore`](super::SqliteStore)
    Sqlite,
}

/// Storage for gene records, merged concepts and source metadata.
///
/// # Safety Considerations
/// - Implementations must be safe under unbounded concurrent readers.
/// - Bulk writes must publish atomically.
pub trait RecordStore: Send + Sync {
    /// Which backend this is.
    fn backend(&self) -> BackendKind;

    /// Slot serializing merge passes against this store within the process.
    fn merge_slot(&self) -> &JobSlot;

    /// File whose advisory lock serializes merge passes across processes,
    /// for backends that other processes can open concurrently.
    fn merge_lock_file(&self) -> Option<PathBuf> {
        None
    }

    /// Creates tables and indexes if they do not exist.
    fn initialize_schema(&self) -> Result<(), StorageError>;

    /// Whether every table the store needs exists.
    fn check_schema_initialized(&self) -> Result<bool, StorageError>;

    /// True only if every known source has metadata and at least one
    /// record and one merged concept are stored.
    fn check_tables_populated(&self) -> Result<bool, StorageError>;

    /// Removes every table. The schema must be initialized again before use.
    fn drop_schema(&self) -> Result<(), StorageError>;

    /// Counter bumped by every change to the stored record set.
    fn records_generation(&self) -> Result<u64, StorageError>;

    /// Replaces every record of `source` with `records` atomically.
    ///
    /// # Errors
    /// - `Integrity`: a concept ID is duplicated within the batch, belongs to
    ///   another source, or a record's source does not match `source`.
    fn put_records(&self, source: SourceName, records: Vec<GeneRecord>) -> Result<(), StorageError>;

    /// Replaces every record of `source` and its metadata in one commit.
    ///
    /// # Errors
    /// Same as [`RecordStore::put_records`]; on error neither is written.
    fn put_source(&self, source: SourceName, records: Vec<GeneRecord>, meta: SourceMeta) -> Result<(), StorageError>;

    /// Replaces the whole merged table atomically and sets every member's `merge_ref`.
    ///
    /// # Errors
    /// - `Integrity`: duplicate canonical IDs, a member claimed twice, or a
    ///   member that is not a stored record.
    fn put_merged(&self, concepts: Vec<MergedConcept>) -> Result<(), StorageError>;

    /// [`RecordStore::put_merged`], committed only while the records
    /// generation still equals `generation`.
    ///
    /// # Errors
    /// - `Conflict`: the record set changed since `generation` was read;
    ///   the merged table is untouched.
    fn put_merged_at(&self, generation: u64, concepts: Vec<MergedConcept>) -> Result<(), StorageError>;

    /// Writes (or overwrites) metadata for `source`.
    fn put_source_metadata(&self, source: SourceName, meta: SourceMeta) -> Result<(), StorageError>;

    /// Reads metadata for `source`.
    fn get_source_metadata(&self, source: SourceName) -> Result<Option<SourceMeta>, StorageError>;

    /// Case-insensitive lookup of a per-source record.
    fn get_by_concept_id(&self, concept_id: &str) -> Result<Option<GeneRecord>, StorageError>;

    /// Case-insensitive lookup of a merged concept.
    fn get_merged(&self, concept_id: &str) -> Result<Option<MergedConcept>, StorageError>;

    /// Concept IDs of records whose `field` equals `value`, case-insensitively.
    fn find_by_field(&self, field: LookupField, value: &str) -> Result<Vec<ConceptId>, StorageError>;

    /// Every stored record ordered by concept ID.
    fn scan_records(&self) -> Result<Vec<GeneRecord>, StorageError>;

    /// Every stored merged concept ordered by concept ID.
    fn scan_merged(&self) -> Result<Vec<MergedConcept>, StorageError>;

    /// Concept IDs of every stored record, ascending.
    fn all_concept_ids(&self) -> Result<Vec<ConceptId>, StorageError>;

    /// Removes all records, lookup entries and metadata of `source`.
    fn delete_source(&self, source: SourceName) -> Result<(), StorageError>;

    /// Removes every merged concept and clears every `merge_ref`.
    fn delete_merged(&self) -> Result<(), StorageError>;
}

/// Refusal returned by `put_merged_at` when the generation moved on.
pub(crate) fn stale_generation(expected: u64, actual: u64) -> StorageError {
    StorageError::Conflict(format!(
        "merged concepts were computed from records generation {expected}, store is at {actual}"
    ))
}

pub(crate) fn normalize_key(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

/// Lookup terms a record contributes to `field`'s index.
pub(crate) fn lookup_terms(record: &GeneRecord, field: LookupField) -> BTreeSet<String> {
    let terms: Vec<&str> = match field {
        LookupField::Symbol => vec![record.symbol.as_str()],
        LookupField::PreviousSymbol => record.previous_symbols.iter().map(String::as_str).collect(),
        LookupField::Alias => record.aliases.iter().map(String::as_str).collect(),
        LookupField::Xref => record.xrefs.iter().map(ConceptId::as_str).collect(),
        LookupField::AssociatedWith => record.associated_with.iter().map(ConceptId::as_str).collect(),
    };
    terms.into_iter().map(normalize_key).filter(|t| !t.is_empty()).collect()
}

/// Batch checks shared by every backend before a per-source replace.
pub(crate) fn check_record_batch(source: SourceName, records: &[GeneRecord]) -> Result<(), StorageError> {
    let mut seen = BTreeSet::new();
    for record in records {
        if record.source != source {
            return Err(StorageError::Integrity(format!(
                "record {} belongs to {}, not {source}",
                record.concept_id, record.source
            )));
        }
        if !seen.insert(record.concept_id.key()) {
            return Err(StorageError::Integrity(format!(
                "duplicate concept_id in {source} load: {}",
                record.concept_id
            )));
        }
    }
    Ok(())
}

/// Batch checks shared by every backend before a merged-table replace.
pub(crate) fn check_merged_batch(concepts: &[MergedConcept]) -> Result<(), StorageError> {
    let mut canonical = BTreeSet::new();
    let mut members = BTreeSet::new();
    for concept in concepts {
        if !canonical.insert(concept.concept_id.key()) {
            return Err(StorageError::Integrity(format!(
                "duplicate merged concept_id: {}",
                concept.concept_id
            )));
        }
        if !concept.has_member(concept.concept_id.as_str()) {
            return Err(StorageError::Integrity(format!(
                "merged concept {} does not list itself as a member",
                concept.concept_id
            )));
        }
        for member in &concept.members {
            if !members.insert(member.key()) {
                return Err(StorageError::Integrity(format!(
                    "record {member} is a member of more than one merged concept"
                )));
            }
        }
    }
    Ok(())
}

/// Evaluates `check_tables_populated` from per-table facts.
pub(crate) fn tables_populated(
    sources_with_metadata: &BTreeSet<SourceName>,
    has_records: bool,
    has_merged: bool,
) -> bool {
    SourceName::ALL.iter().all(|s| sources_with_metadata.contains(s)) && has_records && has_merged
}
