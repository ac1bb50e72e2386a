//! Field-level conflict resolution for one concept group.

use std::collections::{BTreeMap, BTreeSet};

use crate::gene::{ConceptId, GeneRecord};
use crate::merged::MergedConcept;
use crate::source::SourcePriority;

/// Orders members by source priority, then by concept ID key.
pub(crate) fn sort_members(members: &mut [&GeneRecord], priority: &SourcePriority) {
    members.sort_by(|a, b| {
        priority
            .rank(a.source)
            .cmp(&priority.rank(b.source))
            .then_with(|| a.concept_id.key().cmp(&b.concept_id.key()))
    });
}

/// Builds the merged concept for one non-empty group.
///
/// Scalars take the first non-null value in priority order; collections are
/// unioned; per-source fields stay keyed by source.
pub(crate) fn build_concept(mut members: Vec<&GeneRecord>, priority: &SourcePriority) -> MergedConcept {
    sort_members(&mut members, priority);
    let canonical = members[0];

    let mut concept = MergedConcept {
        concept_id: canonical.concept_id.clone(),
        members: members.iter().map(|m| m.concept_id.clone()).collect(),
        symbol: Some(canonical.symbol.clone()),
        symbol_status: members.iter().find_map(|m| m.symbol_status),
        label: members.iter().find_map(|m| m.label.clone()),
        strand: members.iter().find_map(|m| m.strand),
        gene_type: members.iter().find_map(|m| m.gene_type.clone()),
        location_annotations: members
            .iter()
            .find(|m| !m.location_annotations.is_empty())
            .map(|m| m.location_annotations.clone())
            .unwrap_or_default(),
        locations: BTreeMap::new(),
        gene_types: BTreeMap::new(),
        previous_symbols: Vec::new(),
        aliases: BTreeSet::new(),
        xrefs: BTreeSet::new(),
        associated_with: BTreeSet::new(),
    };

    let mut seen_previous = BTreeSet::new();
    let mut xrefs: BTreeMap<String, ConceptId> = BTreeMap::new();
    let canonical_key = canonical.concept_id.key();

    for member in &members {
        if !member.locations.is_empty() {
            concept
                .locations
                .entry(member.source)
                .or_default()
                .extend(member.locations.iter().cloned());
        }
        if let Some(gene_type) = &member.gene_type {
            concept
                .gene_types
                .entry(member.source)
                .or_default()
                .insert(gene_type.clone());
        }
        for symbol in &member.previous_symbols {
            if seen_previous.insert(symbol.as_str()) {
                concept.previous_symbols.push(symbol.clone());
            }
        }
        concept.aliases.extend(member.aliases.iter().cloned());
        concept.associated_with.extend(member.associated_with.iter().cloned());

        for id in std::iter::once(&member.concept_id).chain(&member.xrefs) {
            let key = id.key();
            if key != canonical_key {
                xrefs.entry(key).or_insert_with(|| id.clone());
            }
        }
    }
    concept.xrefs = xrefs.into_values().collect();
    concept
}
