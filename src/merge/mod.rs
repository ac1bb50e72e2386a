//! Merge engine: groups per-source records into canonical concepts.
//!
//! A pass is a full batch recomputation:
//!
//! 1. Note the records generation, then read every stored record
//!    ([`RecordStore::scan_records`]).
//! 2. Build the cross-reference graph and its connected components.
//! 3. Pick the canonical member of each component by source priority, then
//!    by smallest concept ID.
//! 4. Resolve fields into one [`MergedConcept`] per component.
//! 5. Replace the merged table in one call, which also sets every member's
//!    `merge_ref`. The store refuses the write if a source was reloaded after
//!    step 1.
//!
//! Output depends only on the set of stored records and the priority order,
//! never on storage iteration order or the clock.

mod graph;
mod lock;
mod resolve;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gene::GeneRecord;
use crate::merged::MergedConcept;
use crate::source::SourcePriority;
use crate::storage::{RecordStore, StorageError};

pub use graph::{DanglingXref, XrefGraph};
pub use lock::{MergeGuard, MergeLock};

/// Errors that abort a merge pass. The merged table is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Reading records or writing concepts failed.
    #[error("Storage failure during merge: {0}")]
    Storage(StorageError),

    /// Another pass holds the lock.
    #[error("A merge pass is already running")]
    AlreadyRunning,

    /// The lock file could not be opened.
    #[error("Could not take the merge lock: {0}")]
    Lock(String),

    /// The store has no schema.
    #[error("Source tables are not initialized")]
    SchemaUninitialized,

    /// A source was reloaded or deleted while the pass ran.
    #[error("Source records changed during the merge pass: {0}")]
    RecordsChanged(String),
}

impl From<StorageError> for MergeError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::SchemaUninitialized => Self::SchemaUninitialized,
            StorageError::Conflict(detail) => Self::RecordsChanged(detail),
            other => Self::Storage(other),
        }
    }
}

/// Concepts computed from one set of records, not yet persisted.
#[derive(Debug, Clone)]
pub struct MergePlan {
    /// One concept per component, ordered by canonical concept ID key.
    pub concepts: Vec<MergedConcept>,
    /// Xrefs whose target is not a stored record.
    pub dangling: Vec<DanglingXref>,
    /// Records considered, after deduplication.
    pub records: usize,
}

impl MergePlan {
    /// Number of concepts with more than one member.
    #[must_use]
    pub fn grouped(&self) -> usize {
        self.concepts.iter().filter(|c| c.members.len() > 1).count()
    }

    /// BLAKE3 over the sorted groupings, as hex.
    ///
    /// Two passes over the same records produce the same fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for concept in &self.concepts {
            hasher.update(concept.concept_id.key().as_bytes());
            for member in &concept.members {
                hasher.update(b"\t");
                hasher.update(member.key().as_bytes());
            }
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Summary of a completed pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Records read from the store.
    pub records: usize,
    /// Merged concepts written.
    pub concepts: usize,
    /// Concepts with more than one member.
    pub grouped: usize,
    /// Concepts with exactly one member.
    pub singletons: usize,
    /// Xrefs whose target is not a stored record.
    pub dangling: Vec<DanglingXref>,
    /// See [`MergePlan::fingerprint`].
    pub fingerprint: String,
    /// When the pass took the lock.
    pub started_at: DateTime<Utc>,
    /// When the merged table was replaced.
    pub finished_at: DateTime<Utc>,
}

/// Runs merge passes under a configured source priority.
#[derive(Debug, Default)]
pub struct MergeEngine {
    priority: SourcePriority,
    lock: MergeLock,
}

impl MergeEngine {
    /// Engine locking through the store: its in-process slot plus, for stores
    /// kept in files, a lock file beside them.
    #[must_use]
    pub fn new(priority: SourcePriority) -> Self {
        Self {
            priority,
            lock: MergeLock::new(None),
        }
    }

    /// Engine that takes its cross-process lock file in `dir` instead.
    #[must_use]
    pub fn with_lock_dir(priority: SourcePriority, dir: impl Into<PathBuf>) -> Self {
        Self {
            priority,
            lock: MergeLock::new(Some(dir.into())),
        }
    }

    /// Source order used to pick canonical members.
    #[must_use]
    pub fn priority(&self) -> &SourcePriority {
        &self.priority
    }

    /// The pass lock. Holding its guard makes [`MergeEngine::run`] fail fast.
    #[must_use]
    pub fn lock(&self) -> &MergeLock {
        &self.lock
    }

    /// Computes concepts for `records` without touching any store.
    #[must_use]
    pub fn plan(&self, mut records: Vec<GeneRecord>) -> MergePlan {
        records.sort_by_cached_key(|r| r.concept_id.key());
        records.dedup_by(|a, b| a.concept_id.matches(b.concept_id.as_str()));

        let graph = XrefGraph::build(&records);
        tracing::debug!(
            components = graph.components().len(),
            edges = graph.edge_count(),
            "cross-reference graph built"
        );
        let (components, dangling) = graph.into_parts();
        let mut concepts: Vec<MergedConcept> = components
            .iter()
            .map(|members| {
                let members = members.iter().map(|&i| &records[i]).collect();
                resolve::build_concept(members, &self.priority)
            })
            .collect();
        concepts.sort_by_cached_key(|c| c.concept_id.key());

        MergePlan {
            concepts,
            dangling,
            records: records.len(),
        }
    }

    /// Runs a full pass against `store`.
    ///
    /// # Errors
    /// - [`MergeError::AlreadyRunning`] if another pass holds the store's lock
    /// - [`MergeError::SchemaUninitialized`] if the store has no schema
    /// - [`MergeError::RecordsChanged`] if a source was reloaded mid-pass
    /// - [`MergeError::Storage`] if reading records or writing concepts fails
    ///
    /// On any error the previous merged table stays in place.
    pub fn run(&self, store: &dyn RecordStore) -> Result<MergeReport, MergeError> {
        let _guard = self.lock.try_acquire(store)?;
        let started_at = Utc::now();

        if !store.check_schema_initialized()? {
            return Err(MergeError::SchemaUninitialized);
        }
        let generation = store.records_generation()?;
        let records = store.scan_records()?;
        tracing::info!(records = records.len(), generation, "merge pass started");

        let plan = self.plan(records);
        let fingerprint = plan.fingerprint();
        let grouped = plan.grouped();
        let concepts = plan.concepts.len();
        store.put_merged_at(generation, plan.concepts)?;

        let report = MergeReport {
            records: plan.records,
            concepts,
            grouped,
            singletons: concepts - grouped,
            dangling: plan.dangling,
            fingerprint,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            records = report.records,
            concepts = report.concepts,
            grouped = report.grouped,
            dangling = report.dangling.len(),
            fingerprint = %report.fingerprint,
            "merge pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceName;
    use crate::storage::KvStore;

    fn record(source: SourceName, id: &str, symbol: &str, xrefs: &[&str]) -> GeneRecord {
        let mut b = GeneRecord::builder(source, id, symbol);
        for x in xrefs {
            b = b.xref(x);
        }
        b.build().unwrap()
    }

    #[test]
    fn test_plan_is_order_independent() {
        let records = vec![
            record(SourceName::Ncbi, "ncbigene:673", "BRAF", &["hgnc:1097"]),
            record(SourceName::Hgnc, "hgnc:1097", "BRAF", &["ensembl:ENSG00000157764"]),
            record(SourceName::Ensembl, "ensembl:ENSG00000157764", "BRAF", &[]),
            record(SourceName::Hgnc, "hgnc:5", "A1BG", &[]),
        ];
        let mut reversed = records.clone();
        reversed.reverse();

        let engine = MergeEngine::default();
        let a = engine.plan(records);
        let b = engine.plan(reversed);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.concepts, b.concepts);
        assert_eq!(a.grouped(), 1);
    }

    #[test]
    fn test_priority_order_changes_canonical() {
        let records = vec![
            record(SourceName::Ncbi, "ncbigene:673", "BRAF", &["hgnc:1097"]),
            record(SourceName::Hgnc, "hgnc:1097", "BRAF", &[]),
        ];
        let priority = SourcePriority::new(vec![SourceName::Ncbi, SourceName::Hgnc, SourceName::Ensembl]).unwrap();
        let plan = MergeEngine::new(priority).plan(records);
        assert_eq!(plan.concepts[0].concept_id.as_str(), "ncbigene:673");
    }

    #[test]
    fn test_run_sets_merge_refs() {
        let store = KvStore::open_in_memory();
        store
            .put_records(SourceName::Hgnc, vec![record(SourceName::Hgnc, "hgnc:1097", "BRAF", &[])])
            .unwrap();
        store
            .put_records(
                SourceName::Ncbi,
                vec![record(SourceName::Ncbi, "ncbigene:673", "BRAF", &["hgnc:1097", "hgnc:404"])],
            )
            .unwrap();

        let report = MergeEngine::default().run(&store).unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.concepts, 1);
        assert_eq!(report.singletons, 0);
        assert_eq!(report.dangling.len(), 1);

        let ncbi = store.get_by_concept_id("ncbigene:673").unwrap().unwrap();
        assert_eq!(ncbi.merge_ref.unwrap().as_str(), "hgnc:1097");
    }

    #[test]
    fn test_run_rejects_concurrent_pass() {
        let store = KvStore::open_in_memory();
        let engine = MergeEngine::default();
        let _held = engine.lock().try_acquire(&store).unwrap();
        assert_eq!(engine.run(&store).unwrap_err(), MergeError::AlreadyRunning);
    }

    #[test]
    fn test_second_engine_on_same_store_is_refused() {
        let store = KvStore::open_in_memory();
        let first = MergeEngine::default();
        let _held = first.lock().try_acquire(&store).unwrap();

        let second = MergeEngine::default();
        assert_eq!(second.run(&store).unwrap_err(), MergeError::AlreadyRunning);
        assert!(second.run(&KvStore::open_in_memory()).is_ok());
    }

    #[test]
    fn test_conflict_maps_to_records_changed() {
        let err = MergeError::from(StorageError::Conflict("generation 1, expected 0".to_string()));
        assert!(matches!(err, MergeError::RecordsChanged(_)));
    }

    #[test]
    fn test_run_on_uninitialized_store() {
        let store = KvStore::connect_in_memory();
        assert_eq!(
            MergeEngine::default().run(&store).unwrap_err(),
            MergeError::SchemaUninitialized
        );
    }
}
