//! Source load gateway.
//!
//! Source loaders hand over one source's drafts and metadata at a time.
//! Each draft is validated on its own; invalid drafts are reported and
//! skipped, and the accepted remainder replaces the source's records and
//! metadata in one atomic store call.
//!
//! [`update_sources`] reloads several sources in turn and can finish with a
//! merge pass over the result.

use serde::{Deserialize, Serialize};

use crate::error::{NormalizerResult, ValidationError};
use crate::gene::GeneRecordDraft;
use crate::merge::{MergeEngine, MergeReport};
use crate::source::{SourceMeta, SourceName};
use crate::storage::RecordStore;

/// One source's complete reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoad {
    /// Replaces the source's stored metadata along with the records.
    pub metadata: SourceMeta,
    /// Unvalidated records, in loader order.
    pub records: Vec<GeneRecordDraft>,
}

/// A draft that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// Position of the draft in [`SourceLoad::records`].
    pub index: usize,
    /// The draft's concept ID as supplied, if any.
    pub concept_id: Option<String>,
    /// Why the draft was rejected.
    pub error: ValidationError,
}

/// Outcome of [`load_source`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Source that was reloaded.
    pub source: SourceName,
    /// Records written to the store.
    pub accepted: usize,
    /// Drafts skipped by validation.
    pub rejected: Vec<RejectedRecord>,
}

/// Outcome of [`update_sources`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// One report per source, in load order.
    pub loads: Vec<LoadReport>,
    /// The merge pass, if one was requested.
    pub merge: Option<MergeReport>,
}

/// Validates `load` and replaces every stored record of `source`, together
/// with its metadata.
///
/// # Errors
/// - `Storage(Integrity)` if the accepted records clash (for example a
///   duplicate concept ID); nothing from this load is written, metadata
///   included
/// - `Storage` for any other backend failure
pub fn load_source(store: &dyn RecordStore, source: SourceName, load: SourceLoad) -> NormalizerResult<LoadReport> {
    let mut accepted = Vec::with_capacity(load.records.len());
    let mut rejected = Vec::new();

    for (index, draft) in load.records.into_iter().enumerate() {
        let concept_id = draft.concept_id.clone();
        match draft.validate(source) {
            Ok(record) => accepted.push(record),
            Err(error) => {
                tracing::warn!(%source, index, concept_id = ?concept_id, %error, "rejected record");
                rejected.push(RejectedRecord {
                    index,
                    concept_id,
                    error,
                });
            }
        }
    }

    let count = accepted.len();
    store.put_source(source, accepted, load.metadata)?;

    tracing::info!(%source, accepted = count, rejected = rejected.len(), "source loaded");
    Ok(LoadReport {
        source,
        accepted: count,
        rejected,
    })
}

/// Reloads each source in order, then runs `merge` over the whole store if
/// given.
///
/// Stops at the first failing load; sources loaded before it stay loaded and
/// no merge runs.
///
/// # Errors
/// - anything [`load_source`] returns for a source
/// - `Merge` if the final pass fails
pub fn update_sources(
    store: &dyn RecordStore,
    loads: Vec<(SourceName, SourceLoad)>,
    merge: Option<&MergeEngine>,
) -> NormalizerResult<UpdateReport> {
    let mut reports = Vec::with_capacity(loads.len());
    for (source, load) in loads {
        let started = std::time::Instant::now();
        let report = load_source(store, source, load)?;
        tracing::info!(%source, elapsed_ms = started.elapsed().as_millis(), "source reloaded");
        reports.push(report);
    }

    let merge = match merge {
        Some(engine) => Some(engine.run(store)?),
        None => None,
    };
    Ok(UpdateReport {
        loads: reports,
        merge,
    })
}
