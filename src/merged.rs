//! Canonical merged concepts.
//!
//! One [`MergedConcept`] exists per connected component of the
//! cross-reference graph. The whole set is recomputed on every merge pass.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::gene::{ConceptId, GeneLocation, GeneRecord, Strand, SymbolStatus};
use crate::source::SourceName;

/// Canonical identity assembled from every record in a concept group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedConcept {
    /// Concept ID of the highest-priority member.
    pub concept_id: ConceptId,
    /// Member concept IDs in priority order, canonical member first.
    pub members: Vec<ConceptId>,
    /// Symbol of the highest-priority member that has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// First non-empty status in priority order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_status: Option<SymbolStatus>,
    /// First non-empty label in priority order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// First non-empty strand in priority order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strand: Option<Strand>,
    /// First non-empty gene type in priority order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gene_type: Option<String>,
    /// Annotations of the first member that has any.
    #[serde(default)]
    pub location_annotations: Vec<String>,
    /// Locations kept per contributing source.
    #[serde(default)]
    pub locations: BTreeMap<SourceName, Vec<GeneLocation>>,
    /// Gene types kept per contributing source.
    #[serde(default)]
    pub gene_types: BTreeMap<SourceName, BTreeSet<String>>,
    /// Previous symbols of every member, first occurrence wins.
    #[serde(default)]
    pub previous_symbols: Vec<String>,
    /// Union of member aliases.
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    /// Every other concept ID known for this gene, excluding the canonical one.
    #[serde(default)]
    pub xrefs: BTreeSet<ConceptId>,
    /// Union of member associated IDs.
    #[serde(default)]
    pub associated_with: BTreeSet<ConceptId>,
}

impl MergedConcept {
    /// Canonical view of a record that belongs to no larger group.
    #[must_use]
    pub fn singleton(record: &GeneRecord) -> Self {
        let mut locations = BTreeMap::new();
        if !record.locations.is_empty() {
            locations.insert(record.source, record.locations.clone());
        }
        let mut gene_types = BTreeMap::new();
        if let Some(gene_type) = &record.gene_type {
            gene_types.insert(record.source, BTreeSet::from([gene_type.clone()]));
        }
        let xrefs = record
            .xrefs
            .iter()
            .filter(|x| !x.matches(record.concept_id.as_str()))
            .cloned()
            .collect();

        Self {
            concept_id: record.concept_id.clone(),
            members: vec![record.concept_id.clone()],
            symbol: Some(record.symbol.clone()),
            symbol_status: record.symbol_status,
            label: record.label.clone(),
            strand: record.strand,
            gene_type: record.gene_type.clone(),
            location_annotations: record.location_annotations.clone(),
            locations,
            gene_types,
            previous_symbols: record.previous_symbols.clone(),
            aliases: record.aliases.clone(),
            xrefs,
            associated_with: record.associated_with.clone(),
        }
    }

    /// Gene types contributed by `source`, e.g. the HGNC locus type.
    #[must_use]
    pub fn gene_types_for(&self, source: SourceName) -> Option<&BTreeSet<String>> {
        self.gene_types.get(&source)
    }

    /// Whether `concept_id` is a member of this concept, case-insensitively.
    #[must_use]
    pub fn has_member(&self, concept_id: &str) -> bool {
        self.members.iter().any(|m| m.matches(concept_id))
    }

    /// Sources contributing at least one member.
    #[must_use]
    pub fn sources(&self) -> BTreeSet<SourceName> {
        self.members
            .iter()
            .filter_map(|m| SourceName::from_namespace(m.namespace()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_view() {
        let record = GeneRecord::builder(SourceName::Ncbi, "ncbigene:673", "BRAF")
            .gene_type("protein-coding")
            .alias("BRAF1")
            .xref("ncbigene:673")
            .build()
            .unwrap();
        let merged = MergedConcept::singleton(&record);

        assert_eq!(merged.concept_id, record.concept_id);
        assert_eq!(merged.members, vec![record.concept_id.clone()]);
        assert_eq!(merged.symbol.as_deref(), Some("BRAF"));
        assert!(merged.xrefs.is_empty());
        assert!(merged
            .gene_types_for(SourceName::Ncbi)
            .is_some_and(|t| t.contains("protein-coding")));
        assert!(merged.has_member("NCBIGENE:673"));
        assert_eq!(merged.sources(), BTreeSet::from([SourceName::Ncbi]));
    }

    #[test]
    fn test_source_keyed_fields_serialize_by_name() {
        let record = GeneRecord::builder(SourceName::Hgnc, "hgnc:1097", "BRAF")
            .gene_type("gene with protein product")
            .build()
            .unwrap();
        let json = serde_json::to_value(MergedConcept::singleton(&record)).unwrap();
        assert_eq!(json["gene_types"]["HGNC"][0], "gene with protein product");
    }
}
