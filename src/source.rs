//! Data sources and their metadata.
//!
//! Every gene record comes from exactly one curated source. Sources are
//! ranked by a total priority order that decides canonical identity and
//! scalar field selection during merging.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A curated gene data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceName {
    #[serde(rename = "HGNC")]
    Hgnc,
    #[serde(rename = "Ensembl")]
    Ensembl,
    #[serde(rename = "NCBI")]
    Ncbi,
}

impl SourceName {
    /// Every known source, in declaration order.
    pub const ALL: [SourceName; 3] = [SourceName::Hgnc, SourceName::Ensembl, SourceName::Ncbi];

    /// Display name with the source's own capitalization.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hgnc => "HGNC",
            Self::Ensembl => "Ensembl",
            Self::Ncbi => "NCBI",
        }
    }

    /// Namespace prefix used on this source's concept IDs.
    #[must_use]
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::Hgnc => "hgnc",
            Self::Ensembl => "ensembl",
            Self::Ncbi => "ncbigene",
        }
    }

    /// Name of the source-specific gene type field on merged concepts.
    #[must_use]
    pub const fn gene_type_field(self) -> &'static str {
        match self {
            Self::Hgnc => "hgnc_locus_type",
            Self::Ensembl => "ensembl_biotype",
            Self::Ncbi => "ncbi_gene_type",
        }
    }

    /// Resolves the source owning a CURIE namespace, if any.
    #[must_use]
    pub fn from_namespace(namespace: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.namespace().eq_ignore_ascii_case(namespace))
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|src| src.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ValidationError::UnknownSource {
                value: trimmed.to_string(),
            })
    }
}

/// Local identifier prefixes that imply a namespace when a query omits one.
///
/// A bare `ENSG00000157764` is looked up as `ensembl:ENSG00000157764`.
const NAMESPACE_HINTS: &[(&str, SourceName)] = &[("ensg", SourceName::Ensembl)];

/// Expands a bare local identifier into the CURIEs it may stand for.
#[must_use]
pub fn infer_namespaced_ids(query: &str) -> Vec<String> {
    let lowered = query.trim().to_ascii_lowercase();
    if lowered.contains(':') {
        return Vec::new();
    }
    NAMESPACE_HINTS
        .iter()
        .filter(|(hint, _)| lowered.starts_with(hint))
        .map(|(_, source)| format!("{}:{lowered}", source.namespace()))
        .collect()
}

/// Total order over sources, highest priority first.
///
/// The default order is HGNC, then Ensembl, then NCBI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<SourceName>", into = "Vec<SourceName>")]
pub struct SourcePriority {
    order: Vec<SourceName>,
}

impl SourcePriority {
    /// Builds a priority order, which must list every source exactly once.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidPriority`] if a source is missing or repeated.
    pub fn new(order: Vec<SourceName>) -> Result<Self, ValidationError> {
        for source in SourceName::ALL {
            let count = order.iter().filter(|s| **s == source).count();
            if count != 1 {
                return Err(ValidationError::InvalidPriority {
                    reason: format!("{source} appears {count} times"),
                });
            }
        }
        Ok(Self { order })
    }

    /// Position of `source` in the order; lower ranks win.
    #[must_use]
    pub fn rank(&self, source: SourceName) -> usize {
        self.order
            .iter()
            .position(|s| *s == source)
            .unwrap_or(self.order.len())
    }

    /// Sources from highest to lowest priority.
    #[must_use]
    pub fn sources(&self) -> &[SourceName] {
        &self.order
    }
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self {
            order: vec![SourceName::Hgnc, SourceName::Ensembl, SourceName::Ncbi],
        }
    }
}

impl TryFrom<Vec<SourceName>> for SourcePriority {
    type Error = ValidationError;

    fn try_from(order: Vec<SourceName>) -> Result<Self, Self::Error> {
        Self::new(order)
    }
}

impl From<SourcePriority> for Vec<SourceName> {
    fn from(priority: SourcePriority) -> Self {
        priority.order
    }
}

impl FromStr for SourcePriority {
    type Err = ValidationError;

    /// Parses a comma separated list such as `"HGNC,Ensembl,NCBI"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let order = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(SourceName::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(order)
    }
}

/// License attribute flags attached to a source's data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLicenseAttributes {
    /// Use is restricted to non-commercial purposes.
    pub non_commercial: bool,
    /// Derived data must carry the same license.
    pub share_alike: bool,
    /// Attribution is required.
    pub attribution: bool,
}

/// Metadata describing one loaded source release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMeta {
    /// License name, e.g. `CC0`.
    pub data_license: String,
    /// License text URL.
    pub data_license_url: String,
    /// Release version or date.
    pub version: String,
    /// Named download locations, e.g. `"genome_annotations"` to a URL.
    #[serde(default)]
    pub data_url: BTreeMap<String, String>,
    /// Data release policy URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdp_url: Option<String>,
    /// License restriction flags.
    pub data_license_attributes: DataLicenseAttributes,
    /// Reference assemblies, e.g. `GRCh38`.
    #[serde(default)]
    pub genome_assemblies: Vec<String>,
}

impl SourceMeta {
    /// Creates metadata with the required license and version fields.
    #[must_use]
    pub fn new(
        data_license: impl Into<String>,
        data_license_url: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            data_license: data_license.into(),
            data_license_url: data_license_url.into(),
            version: version.into(),
            data_url: BTreeMap::new(),
            rdp_url: None,
            data_license_attributes: DataLicenseAttributes::default(),
            genome_assemblies: Vec::new(),
        }
    }

    /// Adds a named data URL.
    #[must_use]
    pub fn with_data_url(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.data_url.insert(name.into(), url.into());
        self
    }

    /// Sets the genome assemblies the release was built against.
    #[must_use]
    pub fn with_genome_assemblies<I, S>(mut self, assemblies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.genome_assemblies = assemblies.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the license attribute flags.
    #[must_use]
    pub const fn with_license_attributes(mut self, attributes: DataLicenseAttributes) -> Self {
        self.data_license_attributes = attributes;
        self
    }
}
