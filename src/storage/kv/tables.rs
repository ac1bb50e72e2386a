//! Item table model for the key-value backend.
//!
//! All gene data lives in one ordered item table keyed by
//! `(label_and_type, concept_id)`, where `label_and_type` is
//! `"{lowercased term}##{item type}"`:
//!
//! | item type         | term                  | payload                |
//! |-------------------|-----------------------|------------------------|
//! | `identity`        | concept ID            | the [`GeneRecord`]     |
//! | `merger`          | merged concept ID     | the [`MergedConcept`]  |
//! | `symbol`, `alias`, `prev_symbol`, `xref`, `associated_with` | field value | pointer to the record |
//!
//! Lookups are range scans over one `label_and_type` partition. Source
//! metadata sits in a separate table.

use std::collections::{BTreeMap, BTreeSet};

use crate::gene::{ConceptId, GeneRecord};
use crate::merged::MergedConcept;
use crate::source::{SourceMeta, SourceName};
use crate::storage::traits::{
    check_merged_batch, check_record_batch, lookup_terms, normalize_key, stale_generation, tables_populated,
    LookupField, StorageError,
};

use super::snapshot::SnapshotData;
use super::wal::WalEntryKind;

const IDENTITY: &str = "identity";
const MERGER: &str = "merger";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ItemKey {
    label_and_type: String,
    concept_id: String,
}

impl ItemKey {
    fn new(term_key: &str, item_type: &str, concept_id: &ConceptId) -> Self {
        Self {
            label_and_type: format!("{term_key}##{item_type}"),
            concept_id: concept_id.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum Item {
    Identity(GeneRecord),
    Merger(MergedConcept),
    Reference { source: SourceName, concept_id: ConceptId },
}

impl Item {
    fn source(&self) -> Option<SourceName> {
        match self {
            Self::Identity(record) => Some(record.source),
            Self::Reference { source, .. } => Some(*source),
            Self::Merger(_) => None,
        }
    }
}

/// One immutable generation of the key-value tables.
#[derive(Debug, Clone, Default)]
pub struct KvTables {
    schema_initialized: bool,
    records_generation: u64,
    items: BTreeMap<ItemKey, Item>,
    metadata: BTreeMap<SourceName, SourceMeta>,
}

impl KvTables {
    /// Empty tables with the schema in place.
    pub fn initialized() -> Self {
        Self {
            schema_initialized: true,
            ..Self::default()
        }
    }

    /// Rebuilds tables, including lookup entries, from persisted data.
    pub fn from_snapshot(data: SnapshotData) -> Self {
        let mut tables = Self {
            schema_initialized: data.schema_initialized,
            records_generation: data.records_generation,
            items: BTreeMap::new(),
            metadata: data.metadata,
        };
        for record in data.records {
            tables.insert_record(record);
        }
        for concept in data.merged {
            let key = ItemKey::new(&concept.concept_id.key(), MERGER, &concept.concept_id);
            tables.items.insert(key, Item::Merger(concept));
        }
        tables
    }

    /// Persistable copy of this generation.
    pub fn to_snapshot(&self) -> SnapshotData {
        let mut records = Vec::new();
        let mut merged = Vec::new();
        for item in self.items.values() {
            match item {
                Item::Identity(record) => records.push(record.clone()),
                Item::Merger(concept) => merged.push(concept.clone()),
                Item::Reference { .. } => {}
            }
        }
        SnapshotData {
            schema_initialized: self.schema_initialized,
            records_generation: self.records_generation,
            records,
            merged,
            metadata: self.metadata.clone(),
        }
    }

    pub fn schema_initialized(&self) -> bool {
        self.schema_initialized
    }

    pub fn records_generation(&self) -> u64 {
        self.records_generation
    }

    /// Applies one logical write. On error `self` may be partially modified,
    /// so callers apply to a private copy.
    pub fn apply(&mut self, op: &WalEntryKind) -> Result<(), StorageError> {
        if !self.schema_initialized && !matches!(op, WalEntryKind::InitializeSchema | WalEntryKind::DropSchema) {
            return Err(StorageError::SchemaUninitialized);
        }
        match op {
            WalEntryKind::InitializeSchema => {
                self.schema_initialized = true;
                Ok(())
            }
            WalEntryKind::DropSchema => {
                // the generation survives so a pass computed before the drop stays stale
                *self = Self {
                    records_generation: self.records_generation + 1,
                    ..Self::default()
                };
                Ok(())
            }
            WalEntryKind::ReplaceSource { source, records, meta } => {
                self.replace_source(*source, records)?;
                if let Some(meta) = meta {
                    self.metadata.insert(*source, meta.clone());
                }
                Ok(())
            }
            WalEntryKind::ReplaceMerged {
                concepts,
                expected_generation,
            } => {
                if let Some(expected) = *expected_generation {
                    if expected != self.records_generation {
                        return Err(stale_generation(expected, self.records_generation));
                    }
                }
                self.replace_merged(concepts)
            }
            WalEntryKind::PutMetadata { source, meta } => {
                self.metadata.insert(*source, meta.clone());
                Ok(())
            }
            WalEntryKind::DeleteSource { source } => {
                self.remove_source(*source);
                self.metadata.remove(source);
                self.records_generation += 1;
                Ok(())
            }
            WalEntryKind::DeleteMerged => {
                self.clear_merged();
                Ok(())
            }
        }
    }

    fn replace_source(&mut self, source: SourceName, records: &[GeneRecord]) -> Result<(), StorageError> {
        check_record_batch(source, records)?;
        for record in records {
            if let Some(existing) = self.record(record.concept_id.as_str()) {
                if existing.source != source {
                    return Err(StorageError::Integrity(format!(
                        "concept_id {} is already owned by {}",
                        record.concept_id, existing.source
                    )));
                }
            }
        }

        self.remove_source(source);
        for record in records {
            let mut record = record.clone();
            record.merge_ref = None;
            self.insert_record(record);
        }
        self.records_generation += 1;
        Ok(())
    }

    fn replace_merged(&mut self, concepts: &[MergedConcept]) -> Result<(), StorageError> {
        check_merged_batch(concepts)?;
        for concept in concepts {
            if let Some(missing) = concept
                .members
                .iter()
                .find(|m| self.record(m.as_str()).is_none())
            {
                return Err(StorageError::Integrity(format!(
                    "merged concept {} lists unknown member {missing}",
                    concept.concept_id
                )));
            }
        }

        self.clear_merged();
        for concept in concepts {
            for member in &concept.members {
                let Some(key) = self.identity_key(member.as_str()) else {
                    continue;
                };
                if let Some(Item::Identity(record)) = self.items.get_mut(&key) {
                    record.merge_ref = Some(concept.concept_id.clone());
                }
            }
            let key = ItemKey::new(&concept.concept_id.key(), MERGER, &concept.concept_id);
            self.items.insert(key, Item::Merger(concept.clone()));
        }
        Ok(())
    }

    fn insert_record(&mut self, record: GeneRecord) {
        for field in LookupField::ALL {
            for term in lookup_terms(&record, field) {
                self.items.insert(
                    ItemKey::new(&term, field.item_type(), &record.concept_id),
                    Item::Reference {
                        source: record.source,
                        concept_id: record.concept_id.clone(),
                    },
                );
            }
        }
        let key = ItemKey::new(&record.concept_id.key(), IDENTITY, &record.concept_id);
        self.items.insert(key, Item::Identity(record));
    }

    fn remove_source(&mut self, source: SourceName) {
        self.items.retain(|_, item| item.source() != Some(source));
    }

    fn clear_merged(&mut self) {
        self.items.retain(|_, item| !matches!(item, Item::Merger(_)));
        for item in self.items.values_mut() {
            if let Item::Identity(record) = item {
                record.merge_ref = None;
            }
        }
    }

    fn partition<'a>(&'a self, term: &str, item_type: &str) -> impl Iterator<Item = (&'a ItemKey, &'a Item)> + 'a {
        let label_and_type = format!("{}##{item_type}", normalize_key(term));
        let start = ItemKey {
            label_and_type: label_and_type.clone(),
            concept_id: String::new(),
        };
        self.items
            .range(start..)
            .take_while(move |(key, _)| key.label_and_type == label_and_type)
    }

    fn identity_key(&self, concept_id: &str) -> Option<ItemKey> {
        self.partition(concept_id, IDENTITY).next().map(|(key, _)| key.clone())
    }

    pub fn record(&self, concept_id: &str) -> Option<&GeneRecord> {
        self.partition(concept_id, IDENTITY).find_map(|(_, item)| match item {
            Item::Identity(record) => Some(record),
            _ => None,
        })
    }

    pub fn merged(&self, concept_id: &str) -> Option<&MergedConcept> {
        self.partition(concept_id, MERGER).find_map(|(_, item)| match item {
            Item::Merger(concept) => Some(concept),
            _ => None,
        })
    }

    pub fn find(&self, field: LookupField, value: &str) -> Vec<ConceptId> {
        self.partition(value, field.item_type())
            .filter_map(|(_, item)| match item {
                Item::Reference { concept_id, .. } => Some(concept_id.clone()),
                _ => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn records(&self) -> Vec<GeneRecord> {
        let mut records: Vec<GeneRecord> = self
            .items
            .values()
            .filter_map(|item| match item {
                Item::Identity(record) => Some(record.clone()),
                _ => None,
            })
            .collect();
        records.sort_by(|a, b| a.concept_id.cmp(&b.concept_id));
        records
    }

    pub fn merged_concepts(&self) -> Vec<MergedConcept> {
        let mut concepts: Vec<MergedConcept> = self
            .items
            .values()
            .filter_map(|item| match item {
                Item::Merger(concept) => Some(concept.clone()),
                _ => None,
            })
            .collect();
        concepts.sort_by(|a, b| a.concept_id.cmp(&b.concept_id));
        concepts
    }

    pub fn concept_ids(&self) -> Vec<ConceptId> {
        let mut ids: Vec<ConceptId> = self
            .items
            .values()
            .filter_map(|item| match item {
                Item::Identity(record) => Some(record.concept_id.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    pub fn metadata(&self, source: SourceName) -> Option<&SourceMeta> {
        self.metadata.get(&source)
    }

    pub fn populated(&self) -> bool {
        let sources: BTreeSet<SourceName> = self.metadata.keys().copied().collect();
        let has_records = self.items.values().any(|i| matches!(i, Item::Identity(_)));
        let has_merged = self.items.values().any(|i| matches!(i, Item::Merger(_)));
        tables_populated(&sources, has_records, has_merged)
    }
}
