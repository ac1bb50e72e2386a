//! # genenorm - gene concept normalization
//!
//! Independent curated sources (HGNC, Ensembl, NCBI Gene) each describe the
//! same genes under their own identifiers. This crate stores their records,
//! groups records that cross-reference each other into canonical merged
//! concepts, and answers tiered lookups against both.
//!
//! ## Core Concepts
//!
//! - **GeneRecord**: one source's record for one gene, keyed by a CURIE
//!   such as `hgnc:1097`
//! - **MergedConcept**: the canonical identity of a connected group of
//!   records, named after its highest-priority member
//! - **RecordStore**: the storage contract, implemented by a key-value
//!   backend and a SQLite backend with identical semantics
//! - **Match tier**: how a query matched (concept ID, symbol, previous
//!   symbol, alias, xref, associated ID)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use genenorm::{load_source, NormalizerConfig, SourceLoad, SourceName, StoreDump};
//!
//! let config = NormalizerConfig::from_env()?;
//! let store = config.open_store()?;
//!
//! load_source(store.as_ref(), SourceName::Hgnc, hgnc_load)?;
//! load_source(store.as_ref(), SourceName::Ensembl, ensembl_load)?;
//! load_source(store.as_ref(), SourceName::Ncbi, ncbi_load)?;
//!
//! config.merge_engine().run(store.as_ref())?;
//! StoreDump::capture(store.as_ref())?.write_to("genes.json".as_ref())?;
//!
//! let handler = config.query_handler(Arc::clone(&store));
//! let response = handler.normalize("BRAF")?;
//! assert_eq!(response.concept_id().unwrap().as_str(), "hgnc:1097");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod gene;
pub mod merged;
pub mod source;

// Storage, merge and query
pub mod merge;
pub mod query;
pub mod storage;

// Boundaries
pub mod config;
pub mod dump;
pub mod health;
pub mod load;

// Re-export primary types at crate root for convenience
pub use config::{NormalizerConfig, StoreConfig};
pub use dump::StoreDump;
pub use error::{NormalizerError, NormalizerResult, ValidationError};
pub use gene::{ConceptId, GeneLocation, GeneRecord, GeneRecordBuilder, GeneRecordDraft, Strand, SymbolStatus};
pub use health::{check_health, HealthReport};
pub use load::{load_source, update_sources, LoadReport, RejectedRecord, SourceLoad, UpdateReport};
pub use merge::{DanglingXref, MergeEngine, MergeError, MergeReport};
pub use merged::MergedConcept;
pub use query::matcher::MatchTier;
pub use query::{NormalizeResponse, QueryHandler, QueryWarning, SearchOptions, SearchResponse, UnmergedResponse};
pub use source::{DataLicenseAttributes, SourceMeta, SourceName, SourcePriority};
pub use storage::{
    BackendKind, JobGuard, JobSlot, KvConfig, KvStore, LookupField, RecordStore, SqliteConfig, SqliteStore,
    StorageError,
};
