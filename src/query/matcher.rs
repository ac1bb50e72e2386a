//! Match tiers and the ordered stage pipeline.
//!
//! Each stage is a pure lookup against the store for one tier. Callers walk
//! the stages in order; `normalize` stops at the first stage that yields a
//! resolvable candidate, `search` runs all of them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::gene::ConceptId;
use crate::source::infer_namespaced_ids;
use crate::storage::{LookupField, RecordStore, StorageError};

/// How a query matched, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// The query is a stored concept ID.
    ConceptId,
    /// Primary symbol.
    Symbol,
    /// Former symbol.
    PreviousSymbol,
    /// Alias symbol.
    Alias,
    /// Another source's ID listed as a cross-reference.
    Xref,
    /// An external ID the record is associated with.
    AssociatedWith,
    /// Reserved. No stage produces it yet.
    Fuzzy,
    /// Nothing matched.
    NoMatch,
}

impl MatchTier {
    /// Numeric score reported to clients.
    #[must_use]
    pub const fn score(self) -> u8 {
        match self {
            Self::ConceptId | Self::Symbol => 100,
            Self::PreviousSymbol => 80,
            Self::Alias | Self::Xref | Self::AssociatedWith => 60,
            Self::Fuzzy => 20,
            Self::NoMatch => 0,
        }
    }

    /// Wire name of the tier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConceptId => "concept_id",
            Self::Symbol => "symbol",
            Self::PreviousSymbol => "prev_symbol",
            Self::Alias => "alias",
            Self::Xref => "xref",
            Self::AssociatedWith => "associated_with",
            Self::Fuzzy => "fuzzy",
            Self::NoMatch => "no_match",
        }
    }

    const fn from_field(field: LookupField) -> Self {
        match field {
            LookupField::Symbol => Self::Symbol,
            LookupField::PreviousSymbol => Self::PreviousSymbol,
            LookupField::Alias => Self::Alias,
            LookupField::Xref => Self::Xref,
            LookupField::AssociatedWith => Self::AssociatedWith,
        }
    }
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tier of the pipeline.
pub trait MatchStage: Send + Sync {
    fn tier(&self) -> MatchTier;

    /// Concept IDs of per-source records matching `query`, ascending.
    ///
    /// `query` is already trimmed and non-empty.
    fn candidates(&self, store: &dyn RecordStore, query: &str) -> Result<Vec<ConceptId>, StorageError>;
}

/// Exact concept ID, plus namespace inference for bare source IDs.
#[derive(Debug, Default)]
pub struct ConceptIdStage;

impl MatchStage for ConceptIdStage {
    fn tier(&self) -> MatchTier {
        MatchTier::ConceptId
    }

    fn candidates(&self, store: &dyn RecordStore, query: &str) -> Result<Vec<ConceptId>, StorageError> {
        let mut found = Vec::new();
        let inferred = infer_namespaced_ids(query);
        for id in std::iter::once(query).chain(inferred.iter().map(String::as_str)) {
            if let Some(record) = store.get_by_concept_id(id)? {
                if !found.contains(&record.concept_id) {
                    found.push(record.concept_id);
                }
            }
        }
        found.sort_by_cached_key(ConceptId::key);
        Ok(found)
    }
}

/// Case-insensitive exact match on one indexed field.
#[derive(Debug)]
pub struct FieldStage(pub LookupField);

impl MatchStage for FieldStage {
    fn tier(&self) -> MatchTier {
        MatchTier::from_field(self.0)
    }

    fn candidates(&self, store: &dyn RecordStore, query: &str) -> Result<Vec<ConceptId>, StorageError> {
        store.find_by_field(self.0, query)
    }
}

/// Placeholder for approximate matching. Never matches.
#[derive(Debug, Default)]
pub struct FuzzyStage;

impl MatchStage for FuzzyStage {
    fn tier(&self) -> MatchTier {
        MatchTier::Fuzzy
    }

    fn candidates(&self, _store: &dyn RecordStore, _query: &str) -> Result<Vec<ConceptId>, StorageError> {
        Ok(Vec::new())
    }
}

/// Every stage in tier order.
#[must_use]
pub fn default_pipeline() -> Vec<Box<dyn MatchStage>> {
    let mut stages: Vec<Box<dyn MatchStage>> = vec![Box::new(ConceptIdStage)];
    stages.extend(
        LookupField::ALL
            .into_iter()
            .map(|field| Box::new(FieldStage(field)) as Box<dyn MatchStage>),
    );
    stages.push(Box::new(FuzzyStage));
    stages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gene::GeneRecord;
    use crate::source::SourceName;
    use crate::storage::KvStore;

    #[test]
    fn test_pipeline_order_matches_tiers() {
        let tiers: Vec<MatchTier> = default_pipeline().iter().map(|s| s.tier()).collect();
        let mut sorted = tiers.clone();
        sorted.sort();
        assert_eq!(tiers, sorted);
        assert_eq!(tiers.first(), Some(&MatchTier::ConceptId));
        assert_eq!(tiers.last(), Some(&MatchTier::Fuzzy));
    }

    #[test]
    fn test_scores() {
        assert_eq!(MatchTier::ConceptId.score(), 100);
        assert_eq!(MatchTier::PreviousSymbol.score(), 80);
        assert_eq!(MatchTier::Alias.score(), 60);
        assert_eq!(MatchTier::NoMatch.score(), 0);
    }

    #[test]
    fn test_concept_id_stage_infers_namespace() {
        let store = KvStore::open_in_memory();
        let record = GeneRecord::builder(SourceName::Ensembl, "ensembl:ENSG00000157764", "BRAF")
            .build()
            .unwrap();
        store.put_records(SourceName::Ensembl, vec![record]).unwrap();

        let found = ConceptIdStage.candidates(&store, "ENSG00000157764").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].as_str(), "ensembl:ENSG00000157764");
    }

    #[test]
    fn test_fuzzy_stage_never_matches() {
        let store = KvStore::open_in_memory();
        assert!(FuzzyStage.candidates(&store, "braf").unwrap().is_empty());
    }
}
