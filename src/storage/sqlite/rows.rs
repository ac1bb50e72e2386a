//! Conversions between table rows and domain types.
//!
//! Rows are first read into plain string structs inside the rusqlite closure,
//! then decoded outside it so decode failures surface as
//! [`StorageError::Serialization`] rather than SQL errors.

use std::collections::BTreeSet;

use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::gene::{ConceptId, GeneRecord, Strand, SymbolStatus};
use crate::merged::MergedConcept;
use crate::source::{DataLicenseAttributes, SourceMeta, SourceName};
use crate::storage::traits::StorageError;

/// Columns selected from `gene_record_lookup`, in order.
pub const RECORD_COLUMNS: &str = "concept_id, source, symbol, symbol_status, label, strand, gene_type, \
     location_annotations, locations, merge_ref, previous_symbols, aliases, xrefs, associated_with";

/// Columns selected from `gene_merged`, in order.
pub const MERGED_COLUMNS: &str = "concept_id, members, symbol, symbol_status, label, strand, gene_type, \
     location_annotations, locations, gene_types, previous_symbols, aliases, xrefs, associated_with";

/// Columns selected from `gene_sources`, in order.
pub const SOURCE_COLUMNS: &str = "data_license, data_license_url, version, data_url, rdp_url, \
     data_license_nc, data_license_sa, data_license_attr, genome_assemblies";

pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Serialization(format!("{column}: {e}")))
}

fn concept_id(raw: &str) -> Result<ConceptId, StorageError> {
    ConceptId::parse(raw).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn symbol_status(raw: Option<&str>) -> Result<Option<SymbolStatus>, StorageError> {
    raw.map(|s| {
        SymbolStatus::from_wire(s)
            .ok_or_else(|| StorageError::Serialization(format!("unknown symbol_status '{s}'")))
    })
    .transpose()
}

fn strand(raw: Option<&str>) -> Result<Option<Strand>, StorageError> {
    raw.map(|s| Strand::from_wire(s).ok_or_else(|| StorageError::Serialization(format!("unknown strand '{s}'"))))
        .transpose()
}

pub struct RecordRow {
    concept_id: String,
    source: String,
    symbol: String,
    symbol_status: Option<String>,
    label: Option<String>,
    strand: Option<String>,
    gene_type: Option<String>,
    location_annotations: String,
    locations: String,
    merge_ref: Option<String>,
    previous_symbols: String,
    aliases: String,
    xrefs: String,
    associated_with: String,
}

impl RecordRow {
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            concept_id: row.get(0)?,
            source: row.get(1)?,
            symbol: row.get(2)?,
            symbol_status: row.get(3)?,
            label: row.get(4)?,
            strand: row.get(5)?,
            gene_type: row.get(6)?,
            location_annotations: row.get(7)?,
            locations: row.get(8)?,
            merge_ref: row.get(9)?,
            previous_symbols: row.get(10)?,
            aliases: row.get(11)?,
            xrefs: row.get(12)?,
            associated_with: row.get(13)?,
        })
    }

    pub fn decode(self) -> Result<GeneRecord, StorageError> {
        let mut previous: Vec<(i64, String)> = from_json("previous_symbols", &self.previous_symbols)?;
        previous.sort_by_key(|(ordinal, _)| *ordinal);
        let xrefs: Vec<String> = from_json("xrefs", &self.xrefs)?;
        let associated: Vec<String> = from_json("associated_with", &self.associated_with)?;

        Ok(GeneRecord {
            concept_id: concept_id(&self.concept_id)?,
            source: self
                .source
                .parse::<SourceName>()
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            symbol: self.symbol,
            symbol_status: symbol_status(self.symbol_status.as_deref())?,
            label: self.label,
            strand: strand(self.strand.as_deref())?,
            gene_type: self.gene_type,
            locations: from_json("locations", &self.locations)?,
            location_annotations: from_json("location_annotations", &self.location_annotations)?,
            previous_symbols: previous.into_iter().map(|(_, s)| s).collect(),
            aliases: from_json("aliases", &self.aliases)?,
            xrefs: xrefs.iter().map(|x| concept_id(x)).collect::<Result<BTreeSet<_>, _>>()?,
            associated_with: associated
                .iter()
                .map(|x| concept_id(x))
                .collect::<Result<BTreeSet<_>, _>>()?,
            merge_ref: self.merge_ref.as_deref().map(concept_id).transpose()?,
        })
    }
}

pub struct MergedRow {
    concept_id: String,
    members: String,
    symbol: Option<String>,
    symbol_status: Option<String>,
    label: Option<String>,
    strand: Option<String>,
    gene_type: Option<String>,
    location_annotations: String,
    locations: String,
    gene_types: String,
    previous_symbols: String,
    aliases: String,
    xrefs: String,
    associated_with: String,
}

impl MergedRow {
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            concept_id: row.get(0)?,
            members: row.get(1)?,
            symbol: row.get(2)?,
            symbol_status: row.get(3)?,
            label: row.get(4)?,
            strand: row.get(5)?,
            gene_type: row.get(6)?,
            location_annotations: row.get(7)?,
            locations: row.get(8)?,
            gene_types: row.get(9)?,
            previous_symbols: row.get(10)?,
            aliases: row.get(11)?,
            xrefs: row.get(12)?,
            associated_with: row.get(13)?,
        })
    }

    pub fn decode(self) -> Result<MergedConcept, StorageError> {
        Ok(MergedConcept {
            concept_id: concept_id(&self.concept_id)?,
            members: from_json("members", &self.members)?,
            symbol: self.symbol,
            symbol_status: symbol_status(self.symbol_status.as_deref())?,
            label: self.label,
            strand: strand(self.strand.as_deref())?,
            gene_type: self.gene_type,
            location_annotations: from_json("location_annotations", &self.location_annotations)?,
            locations: from_json("locations", &self.locations)?,
            gene_types: from_json("gene_types", &self.gene_types)?,
            previous_symbols: from_json("previous_symbols", &self.previous_symbols)?,
            aliases: from_json("aliases", &self.aliases)?,
            xrefs: from_json("xrefs", &self.xrefs)?,
            associated_with: from_json("associated_with", &self.associated_with)?,
        })
    }
}

pub struct SourceRow {
    data_license: String,
    data_license_url: String,
    version: String,
    data_url: String,
    rdp_url: Option<String>,
    non_commercial: bool,
    share_alike: bool,
    attribution: bool,
    genome_assemblies: String,
}

impl SourceRow {
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            data_license: row.get(0)?,
            data_license_url: row.get(1)?,
            version: row.get(2)?,
            data_url: row.get(3)?,
            rdp_url: row.get(4)?,
            non_commercial: row.get(5)?,
            share_alike: row.get(6)?,
            attribution: row.get(7)?,
            genome_assemblies: row.get(8)?,
        })
    }

    pub fn decode(self) -> Result<SourceMeta, StorageError> {
        Ok(SourceMeta {
            data_license: self.data_license,
            data_license_url: self.data_license_url,
            version: self.version,
            data_url: from_json("data_url", &self.data_url)?,
            rdp_url: self.rdp_url,
            data_license_attributes: DataLicenseAttributes {
                non_commercial: self.non_commercial,
                share_alike: self.share_alike,
                attribution: self.attribution,
            },
            genome_assemblies: from_json("genome_assemblies", &self.genome_assemblies)?,
        })
    }
}
