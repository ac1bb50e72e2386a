//! Response types for the three query modes.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::gene::{ConceptId, GeneRecord};
use crate::merged::MergedConcept;
use crate::source::{SourceMeta, SourceName};

use super::matcher::MatchTier;

/// Non-fatal findings attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryWarning {
    /// The query contains a non-breaking space, which never matches stored terms.
    NonBreakingSpace { query: String },
    /// The winning tier also matched records of these other concepts.
    MultipleNormalizedConcepts { concept_ids: Vec<ConceptId> },
}

fn nbsp_pattern() -> &'static Regex {
    static NBSP: OnceLock<Regex> = OnceLock::new();
    NBSP.get_or_init(|| Regex::new(r"\x{a0}|&nbsp;").expect("nbsp pattern compiles"))
}

pub(crate) fn query_warnings(query: &str) -> Vec<QueryWarning> {
    if nbsp_pattern().is_match(query) {
        tracing::warn!(query, "query contains a non-breaking space");
        vec![QueryWarning::NonBreakingSpace {
            query: query.to_string(),
        }]
    } else {
        Vec::new()
    }
}

/// A record and the best tier it matched at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMatch {
    /// Best tier this record matched at.
    pub tier: MatchTier,
    /// The matched record.
    pub record: GeneRecord,
}

/// Search results from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMatches {
    /// Best tier among `records`, or `NoMatch`.
    pub tier: MatchTier,
    /// Ordered by tier, then concept ID.
    pub records: Vec<RecordMatch>,
    /// The source's metadata, if loaded.
    pub source_meta: Option<SourceMeta>,
}

/// Result of [`QueryHandler::search`](super::QueryHandler::search).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// The query as received.
    pub query: String,
    /// Non-fatal findings.
    pub warnings: Vec<QueryWarning>,
    /// One entry per searched source, matched or not.
    pub source_matches: BTreeMap<SourceName, SourceMatches>,
}

/// Result of [`QueryHandler::normalize`](super::QueryHandler::normalize).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeResponse {
    /// The query as received.
    pub query: String,
    /// Non-fatal findings.
    pub warnings: Vec<QueryWarning>,
    /// Tier at which the concept was found.
    pub tier: MatchTier,
    /// `None` exactly when `tier` is `NoMatch`.
    pub concept: Option<MergedConcept>,
    /// Metadata of every source contributing to `concept`.
    pub source_meta: BTreeMap<SourceName, SourceMeta>,
}

impl NormalizeResponse {
    /// Concept ID of the match, if any.
    #[must_use]
    pub fn concept_id(&self) -> Option<&ConceptId> {
        self.concept.as_ref().map(|c| &c.concept_id)
    }
}

/// Member records of one source under the normalized concept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmergedMatches {
    /// Member records from this source.
    pub records: Vec<GeneRecord>,
    /// The source's metadata, if loaded.
    pub source_meta: Option<SourceMeta>,
}

/// Result of [`QueryHandler::normalize_unmerged`](super::QueryHandler::normalize_unmerged).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmergedResponse {
    /// The query as received.
    pub query: String,
    /// Non-fatal findings.
    pub warnings: Vec<QueryWarning>,
    /// Tier at which the concept was found.
    pub tier: MatchTier,
    /// Canonical ID of the matched concept.
    pub normalized_concept_id: Option<ConceptId>,
    /// Member records grouped by source.
    pub source_matches: BTreeMap<SourceName, UnmergedMatches>,
}
