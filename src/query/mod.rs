//! Read path: `search`, `normalize` and `normalize_unmerged`.
//!
//! Every mode runs the same tier pipeline (see [`matcher`]) against the
//! store. Queries are trimmed; matching is case-insensitive and exact. An
//! unmatched query is a `NoMatch` response, never an error: only backend
//! failures and invalid search options surface as `Err`.
//!
//! # Normalization
//!
//! 1. A merged concept whose ID equals the query wins outright.
//! 2. Otherwise the stages run in tier order. Candidates within a tier are
//!    ordered by source priority, then concept ID, and the first whose
//!    `merge_ref` resolves wins. A record that has not been merged yet
//!    normalizes to a singleton view of itself.
//! 3. Candidates of the winning tier that belong to other concepts are
//!    reported in a [`QueryWarning::MultipleNormalizedConcepts`] warning.

pub mod matcher;
mod response;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{NormalizerError, NormalizerResult};
use crate::gene::{ConceptId, GeneRecord};
use crate::merged::MergedConcept;
use crate::source::{infer_namespaced_ids, SourceName, SourcePriority};
use crate::storage::{RecordStore, StorageError};

use matcher::{default_pipeline, MatchStage, MatchTier};
use response::query_warnings;
pub use response::{
    NormalizeResponse, QueryWarning, RecordMatch, SearchResponse, SourceMatches, UnmergedMatches,
    UnmergedResponse,
};

/// Source filters for `search`. At most one of the two lists may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Source names to search; empty means all.
    pub include: Vec<String>,
    /// Source names to skip.
    pub exclude: Vec<String>,
}

impl SearchOptions {
    /// Searches only the comma-separated sources in `list`.
    #[must_use]
    pub fn include(list: &str) -> Self {
        Self {
            include: split_list(list),
            exclude: Vec::new(),
        }
    }

    /// Searches every source except the comma-separated ones in `list`.
    #[must_use]
    pub fn exclude(list: &str) -> Self {
        Self {
            include: Vec::new(),
            exclude: split_list(list),
        }
    }

    /// Resolves the filters into the set of sources to search.
    ///
    /// # Errors
    /// [`NormalizerError::InvalidParameter`] if both lists are set or a name
    /// is not a known source.
    pub fn sources(&self) -> NormalizerResult<BTreeSet<SourceName>> {
        if !self.include.is_empty() && !self.exclude.is_empty() {
            return Err(NormalizerError::invalid_parameter(
                "Cannot request both source inclusions and exclusions.",
            ));
        }
        let include = parse_sources(&self.include)?;
        let exclude = parse_sources(&self.exclude)?;
        Ok(SourceName::ALL
            .into_iter()
            .filter(|s| include.is_empty() || include.contains(s))
            .filter(|s| !exclude.contains(s))
            .collect())
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_sources(names: &[String]) -> NormalizerResult<BTreeSet<SourceName>> {
    let mut sources = BTreeSet::new();
    let mut invalid = Vec::new();
    for name in names {
        match name.parse::<SourceName>() {
            Ok(source) => {
                sources.insert(source);
            }
            Err(_) => invalid.push(name.as_str()),
        }
    }
    if invalid.is_empty() {
        Ok(sources)
    } else {
        Err(NormalizerError::invalid_parameter(format!(
            "Invalid source name(s): {invalid:?}"
        )))
    }
}

struct Resolution {
    tier: MatchTier,
    concept: MergedConcept,
    alternates: Vec<ConceptId>,
}

/// Answers queries against one store.
pub struct QueryHandler {
    store: Arc<dyn RecordStore>,
    priority: SourcePriority,
    stages: Vec<Box<dyn MatchStage>>,
}

impl QueryHandler {
    /// Handler over `store` using the default stage pipeline.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, priority: SourcePriority) -> Self {
        Self {
            store,
            priority,
            stages: default_pipeline(),
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Best match per record across every tier, grouped by source.
    ///
    /// # Errors
    /// - `InvalidParameter` for bad source filters
    /// - `Storage` if the backend fails
    pub fn search(&self, query: &str, options: &SearchOptions) -> NormalizerResult<SearchResponse> {
        let sources = options.sources()?;
        let warnings = query_warnings(query);
        let term = query.trim();

        let mut best: BTreeMap<String, RecordMatch> = BTreeMap::new();
        if !term.is_empty() {
            for stage in &self.stages {
                for id in stage.candidates(self.store.as_ref(), term)? {
                    let key = id.key();
                    if best.contains_key(&key) {
                        continue;
                    }
                    let Some(record) = self.store.get_by_concept_id(id.as_str())? else {
                        continue;
                    };
                    if sources.contains(&record.source) {
                        best.insert(key, RecordMatch { tier: stage.tier(), record });
                    }
                }
            }
        }

        let mut source_matches = BTreeMap::new();
        for source in &sources {
            source_matches.insert(
                *source,
                SourceMatches {
                    tier: MatchTier::NoMatch,
                    records: Vec::new(),
                    source_meta: self.store.get_source_metadata(*source)?,
                },
            );
        }
        for found in best.into_values() {
            if let Some(matches) = source_matches.get_mut(&found.record.source) {
                matches.records.push(found);
            }
        }
        for matches in source_matches.values_mut() {
            matches
                .records
                .sort_by_cached_key(|m| (m.tier, m.record.concept_id.key()));
            matches.tier = matches.records.first().map_or(MatchTier::NoMatch, |m| m.tier);
        }

        tracing::debug!(query = term, sources = sources.len(), "search finished");
        Ok(SearchResponse {
            query: query.to_string(),
            warnings,
            source_matches,
        })
    }

    /// Resolves `query` to a single merged concept.
    ///
    /// # Errors
    /// `Storage` if the backend fails.
    pub fn normalize(&self, query: &str) -> NormalizerResult<NormalizeResponse> {
        let mut response = NormalizeResponse {
            query: query.to_string(),
            warnings: query_warnings(query),
            tier: MatchTier::NoMatch,
            concept: None,
            source_meta: BTreeMap::new(),
        };
        let Some(resolution) = self.resolve(query.trim())? else {
            return Ok(response);
        };

        for source in resolution.concept.sources() {
            if let Some(meta) = self.store.get_source_metadata(source)? {
                response.source_meta.insert(source, meta);
            }
        }
        if !resolution.alternates.is_empty() {
            response.warnings.push(QueryWarning::MultipleNormalizedConcepts {
                concept_ids: resolution.alternates,
            });
        }
        response.tier = resolution.tier;
        response.concept = Some(resolution.concept);
        Ok(response)
    }

    /// Resolves `query` like [`normalize`](Self::normalize) and returns the
    /// member records of the concept, grouped by source.
    ///
    /// # Errors
    /// `Storage` if the backend fails.
    pub fn normalize_unmerged(&self, query: &str) -> NormalizerResult<UnmergedResponse> {
        let mut response = UnmergedResponse {
            query: query.to_string(),
            warnings: query_warnings(query),
            tier: MatchTier::NoMatch,
            normalized_concept_id: None,
            source_matches: BTreeMap::new(),
        };
        let Some(resolution) = self.resolve(query.trim())? else {
            return Ok(response);
        };

        for member in &resolution.concept.members {
            let Some(record) = self.store.get_by_concept_id(member.as_str())? else {
                tracing::warn!(member = %member, concept_id = %resolution.concept.concept_id, "member record missing");
                continue;
            };
            let source = record.source;
            if !response.source_matches.contains_key(&source) {
                let source_meta = self.store.get_source_metadata(source)?;
                response.source_matches.insert(
                    source,
                    UnmergedMatches {
                        records: Vec::new(),
                        source_meta,
                    },
                );
            }
            if let Some(matches) = response.source_matches.get_mut(&source) {
                matches.records.push(record);
            }
        }
        if !resolution.alternates.is_empty() {
            response.warnings.push(QueryWarning::MultipleNormalizedConcepts {
                concept_ids: resolution.alternates,
            });
        }
        response.tier = resolution.tier;
        response.normalized_concept_id = Some(resolution.concept.concept_id);
        Ok(response)
    }

    fn resolve(&self, term: &str) -> Result<Option<Resolution>, StorageError> {
        if term.is_empty() {
            return Ok(None);
        }

        let inferred = infer_namespaced_ids(term);
        for id in std::iter::once(term).chain(inferred.iter().map(String::as_str)) {
            if let Some(concept) = self.store.get_merged(id)? {
                tracing::debug!(query = term, concept_id = %concept.concept_id, "matched merged concept id");
                return Ok(Some(Resolution {
                    tier: MatchTier::ConceptId,
                    concept,
                    alternates: Vec::new(),
                }));
            }
        }

        for stage in &self.stages {
            let ids = stage.candidates(self.store.as_ref(), term)?;
            if ids.is_empty() {
                continue;
            }
            let mut records = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(record) = self.store.get_by_concept_id(id.as_str())? {
                    records.push(record);
                }
            }
            records.sort_by_cached_key(|r| (self.priority.rank(r.source), r.concept_id.key()));

            for record in &records {
                let Some(concept) = self.follow_merge_ref(record)? else {
                    continue;
                };
                let alternates = alternates(&records, &concept);
                tracing::debug!(
                    query = term,
                    tier = %stage.tier(),
                    concept_id = %concept.concept_id,
                    alternates = alternates.len(),
                    "normalized"
                );
                return Ok(Some(Resolution {
                    tier: stage.tier(),
                    concept,
                    alternates,
                }));
            }
        }
        Ok(None)
    }

    fn follow_merge_ref(&self, record: &GeneRecord) -> Result<Option<MergedConcept>, StorageError> {
        let Some(merge_ref) = &record.merge_ref else {
            return Ok(Some(MergedConcept::singleton(record)));
        };
        let merged = self.store.get_merged(merge_ref.as_str())?;
        if merged.is_none() {
            tracing::error!(
                concept_id = %record.concept_id,
                merge_ref = %merge_ref,
                "merge_ref does not resolve to a merged concept"
            );
        }
        Ok(merged)
    }
}

/// Concepts of the other candidates in a tier, excluding `chosen`.
fn alternates(candidates: &[GeneRecord], chosen: &MergedConcept) -> Vec<ConceptId> {
    let mut others = BTreeMap::new();
    for record in candidates {
        let group = record.merge_ref.as_ref().unwrap_or(&record.concept_id);
        if !group.matches(chosen.concept_id.as_str()) {
            others.entry(group.key()).or_insert_with(|| group.clone());
        }
    }
    others.into_values().collect()
}
