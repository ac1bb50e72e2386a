//! Per-source gene records.
//!
//! A [`GeneRecord`] is one source's view of one gene. Records are created in
//! bulk when a source is reloaded and are never partially mutated; the only
//! field the store itself writes is [`GeneRecord::merge_ref`].
//!
//! Source loaders hand over [`GeneRecordDraft`] values, which are validated
//! into records at the load boundary.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::source::SourceName;

const CURIE_PATTERN: &str = r"^\w[^:]*:.+$";

fn curie_regex() -> &'static Regex {
    static CURIE: OnceLock<Regex> = OnceLock::new();
    CURIE.get_or_init(|| Regex::new(CURIE_PATTERN).expect("CURIE pattern compiles"))
}

/// A compact URI identifier such as `hgnc:1097`.
///
/// Comparison and ordering are case-sensitive; lookups go through
/// [`ConceptId::key`], which is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConceptId(String);

impl ConceptId {
    /// Parses and validates a CURIE.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidCurie`] if `value` has no namespace
    /// or no local identifier.
    pub fn parse(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        let trimmed = value.trim();
        if !curie_regex().is_match(trimmed) {
            return Err(ValidationError::InvalidCurie { value });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The namespace before the first colon.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split_once(':').map_or("", |(ns, _)| ns)
    }

    /// The local identifier after the first colon.
    #[must_use]
    pub fn local_id(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, id)| id)
    }

    /// Case-insensitive lookup key.
    #[must_use]
    pub fn key(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive equality.
    #[must_use]
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ConceptId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ConceptId> for String {
    fn from(id: ConceptId) -> Self {
        id.0
    }
}

impl AsRef<str> for ConceptId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Approval status of a gene symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolStatus {
    Approved,
    Withdrawn,
    Discontinued,
}

impl SymbolStatus {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Withdrawn => "withdrawn",
            Self::Discontinued => "discontinued",
        }
    }

    /// Parses the wire representation.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "withdrawn" => Some(Self::Withdrawn),
            "discontinued" => Some(Self::Discontinued),
            _ => None,
        }
    }
}

/// Strand of the reference sequence a gene lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strand {
    #[serde(rename = "+")]
    Forward,
    #[serde(rename = "-")]
    Reverse,
}

impl Strand {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "+",
            Self::Reverse => "-",
        }
    }

    /// Parses the wire representation.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "+" => Some(Self::Forward),
            "-" => Some(Self::Reverse),
            _ => None,
        }
    }
}

/// A genomic interval. Opaque to the merge and query engines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GeneLocation {
    /// Cytogenetic interval, e.g. chromosome 7 from q34 to q34.
    #[serde(rename = "ChromosomeLocation")]
    Chromosome {
        species_id: String,
        chr: String,
        start: String,
        end: String,
    },
    /// Interval on a sequence, inter-residue coordinates.
    #[serde(rename = "SequenceLocation")]
    Sequence {
        sequence_id: String,
        start: u64,
        end: u64,
    },
}

impl GeneLocation {
    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Chromosome { chr, .. } if chr.trim().is_empty() => {
                Err(ValidationError::InvalidLocation {
                    reason: "chromosome cannot be empty".to_string(),
                })
            }
            Self::Sequence { start, end, .. } if start > end => Err(ValidationError::InvalidLocation {
                reason: format!("start {start} is after end {end}"),
            }),
            Self::Sequence { sequence_id, .. } if sequence_id.trim().is_empty() => {
                Err(ValidationError::InvalidLocation {
                    reason: "sequence_id cannot be empty".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// One source's record for one gene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneRecord {
    /// Globally unique CURIE, e.g. `hgnc:1097`.
    pub concept_id: ConceptId,
    /// Source that owns the record.
    pub source: SourceName,
    /// Primary symbol.
    pub symbol: String,
    /// HGNC approval status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_status: Option<SymbolStatus>,
    /// Full gene name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Strand of the gene on its reference sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strand: Option<Strand>,
    /// Source-specific gene type, e.g. HGNC locus type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gene_type: Option<String>,
    /// Genomic locations as supplied by the source.
    #[serde(default)]
    pub locations: Vec<GeneLocation>,
    /// Free-text location notes, e.g. `not on reference assembly`.
    #[serde(default)]
    pub location_annotations: Vec<String>,
    /// Ordered, deduplicated.
    #[serde(default)]
    pub previous_symbols: Vec<String>,
    /// Other symbols used for the gene.
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    /// Records in other sources describing the same gene.
    #[serde(default)]
    pub xrefs: BTreeSet<ConceptId>,
    /// External identifiers that are not merge candidates.
    #[serde(default)]
    pub associated_with: BTreeSet<ConceptId>,
    /// Canonical concept this record was merged into, set by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_ref: Option<ConceptId>,
}

impl GeneRecord {
    /// Starts building a record for `source`.
    #[must_use]
    pub fn builder(source: SourceName, concept_id: &str, symbol: &str) -> GeneRecordBuilder {
        GeneRecordBuilder {
            source,
            draft: GeneRecordDraft {
                concept_id: Some(concept_id.to_string()),
                symbol: Some(symbol.to_string()),
                ..GeneRecordDraft::default()
            },
        }
    }
}

/// Unvalidated record as produced by a source loader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneRecordDraft {
    pub concept_id: Option<String>,
    pub symbol: Option<String>,
    pub symbol_status: Option<SymbolStatus>,
    pub label: Option<String>,
    pub strand: Option<Strand>,
    pub gene_type: Option<String>,
    pub locations: Vec<GeneLocation>,
    pub location_annotations: Vec<String>,
    pub previous_symbols: Vec<String>,
    pub aliases: Vec<String>,
    pub xrefs: Vec<String>,
    pub associated_with: Vec<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn dedup_ordered(values: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

fn parse_curies(values: Vec<String>) -> Result<BTreeSet<ConceptId>, ValidationError> {
    values
        .into_iter()
        .filter(|v| !v.trim().is_empty())
        .map(ConceptId::parse)
        .collect()
}

impl GeneRecordDraft {
    /// Validates the draft as a record of `source`.
    ///
    /// # Errors
    /// Returns the first [`ValidationError`] found; the record must be rejected.
    pub fn validate(self, source: SourceName) -> Result<GeneRecord, ValidationError> {
        let raw_id = self
            .concept_id
            .ok_or(ValidationError::MissingField { field: "concept_id" })?;
        let concept_id = ConceptId::parse(raw_id)?;
        if !concept_id.namespace().eq_ignore_ascii_case(source.namespace()) {
            return Err(ValidationError::NamespaceMismatch {
                concept_id: concept_id.to_string(),
                expected: source.namespace(),
            });
        }

        let symbol = self
            .symbol
            .ok_or(ValidationError::MissingField { field: "symbol" })?;
        let symbol = symbol.trim().to_string();
        if symbol.is_empty() {
            return Err(ValidationError::EmptyField { field: "symbol" });
        }

        for location in &self.locations {
            location.validate()?;
        }

        Ok(GeneRecord {
            concept_id,
            source,
            symbol,
            symbol_status: self.symbol_status,
            label: non_empty(self.label),
            strand: self.strand,
            gene_type: non_empty(self.gene_type),
            locations: self.locations,
            location_annotations: dedup_ordered(self.location_annotations),
            previous_symbols: dedup_ordered(self.previous_symbols),
            aliases: dedup_ordered(self.aliases).into_iter().collect(),
            xrefs: parse_curies(self.xrefs)?,
            associated_with: parse_curies(self.associated_with)?,
            merge_ref: None,
        })
    }
}

/// Fluent builder over [`GeneRecordDraft`].
#[derive(Debug, Clone)]
pub struct GeneRecordBuilder {
    source: SourceName,
    draft: GeneRecordDraft,
}

impl GeneRecordBuilder {
    /// Sets the symbol status.
    #[must_use]
    pub fn symbol_status(mut self, status: SymbolStatus) -> Self {
        self.draft.symbol_status = Some(status);
        self
    }

    /// Sets the full gene name.
    #[must_use]
    pub fn label(mut self, label: &str) -> Self {
        self.draft.label = Some(label.to_string());
        self
    }

    /// Sets the strand.
    #[must_use]
    pub fn strand(mut self, strand: Strand) -> Self {
        self.draft.strand = Some(strand);
        self
    }

    /// Sets the source-specific gene type.
    #[must_use]
    pub fn gene_type(mut self, gene_type: &str) -> Self {
        self.draft.gene_type = Some(gene_type.to_string());
        self
    }

    /// Adds a location.
    #[must_use]
    pub fn location(mut self, location: GeneLocation) -> Self {
        self.draft.locations.push(location);
        self
    }

    /// Adds a location annotation.
    #[must_use]
    pub fn location_annotation(mut self, annotation: &str) -> Self {
        self.draft.location_annotations.push(annotation.to_string());
        self
    }

    /// Adds a previous symbol.
    #[must_use]
    pub fn previous_symbol(mut self, symbol: &str) -> Self {
        self.draft.previous_symbols.push(symbol.to_string());
        self
    }

    /// Adds an alias.
    #[must_use]
    pub fn alias(mut self, alias: &str) -> Self {
        self.draft.aliases.push(alias.to_string());
        self
    }

    /// Adds a cross-reference to another source's record.
    #[must_use]
    pub fn xref(mut self, curie: &str) -> Self {
        self.draft.xrefs.push(curie.to_string());
        self
    }

    /// Adds an associated external identifier.
    #[must_use]
    pub fn associated_with(mut self, curie: &str) -> Self {
        self.draft.associated_with.push(curie.to_string());
        self
    }

    /// Validates and builds the record.
    ///
    /// # Errors
    /// Returns a [`ValidationError`] if any field is invalid.
    pub fn build(self) -> Result<GeneRecord, ValidationError> {
        self.draft.validate(self.source)
    }
}
