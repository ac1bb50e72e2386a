//! Cross-reference graph over stored records.
//!
//! Nodes are the concept IDs of the records handed in; an undirected edge
//! joins two records when either one lists the other as an xref. Connected
//! components are computed with a union-find, so duplicate and reciprocal
//! edges collapse for free.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};

use crate::gene::{ConceptId, GeneRecord};

/// An xref naming a concept that is not among the stored records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DanglingXref {
    /// Record that carries the xref.
    pub from: ConceptId,
    /// The unresolved target.
    pub to: ConceptId,
}

/// Connected components of the cross-reference graph.
#[derive(Debug)]
pub struct XrefGraph {
    components: Vec<Vec<usize>>,
    edges: usize,
    dangling: Vec<DanglingXref>,
}

impl XrefGraph {
    /// Builds the graph over `records`, which must be sorted by concept ID key
    /// and free of duplicate keys.
    ///
    /// Component member indexes refer back into `records`.
    #[must_use]
    pub fn build(records: &[GeneRecord]) -> Self {
        let index: BTreeMap<String, usize> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.concept_id.key(), i))
            .collect();

        let mut sets = UnionFind::<usize>::new(records.len());
        let mut edges = BTreeSet::new();
        let mut dangling = Vec::new();

        for (from, record) in records.iter().enumerate() {
            for xref in &record.xrefs {
                let Some(&to) = index.get(&xref.key()) else {
                    dangling.push(DanglingXref {
                        from: record.concept_id.clone(),
                        to: xref.clone(),
                    });
                    continue;
                };
                if to == from {
                    continue;
                }
                edges.insert((from.min(to), from.max(to)));
                sets.union(from, to);
            }
        }

        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (node, root) in sets.into_labeling().into_iter().enumerate() {
            by_root.entry(root).or_default().push(node);
        }
        let mut components: Vec<Vec<usize>> = by_root.into_values().collect();
        // smallest member key first, independent of union order
        components.sort_by_key(|members| members[0]);

        for d in &dangling {
            tracing::warn!(from = %d.from, to = %d.to, "dangling cross-reference ignored");
        }

        Self {
            components,
            edges: edges.len(),
            dangling,
        }
    }

    /// Components as lists of record indexes, each sorted ascending.
    #[must_use]
    pub fn components(&self) -> &[Vec<usize>] {
        &self.components
    }

    /// Number of distinct undirected edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges
    }

    /// Unresolved xrefs, in record order.
    #[must_use]
    pub fn dangling(&self) -> &[DanglingXref] {
        &self.dangling
    }

    pub(crate) fn into_parts(self) -> (Vec<Vec<usize>>, Vec<DanglingXref>) {
        (self.components, self.dangling)
    }
}
