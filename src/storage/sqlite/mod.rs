//! Relational storage backend on SQLite.
//!
//! Records are normalized into `gene_concepts` plus one child table per
//! multi-valued field; merged concepts live in `gene_merged` with JSON
//! columns for their collections. Reads go through the
//! `gene_record_lookup` view.
//!
//! Every bulk write runs in one IMMEDIATE transaction with deferred foreign
//! keys. Readers in WAL mode keep seeing the previous committed generation
//! until the commit lands.

mod pool;
mod rows;
mod schema;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};

use crate::error::NormalizerError;
use crate::gene::{ConceptId, GeneRecord, Strand, SymbolStatus};
use crate::merged::MergedConcept;
use crate::source::{SourceMeta, SourceName};
use crate::storage::traits::{
    check_merged_batch, check_record_batch, normalize_key, stale_generation, tables_populated, BackendKind,
    JobSlot, LookupField, RecordStore, StorageError,
};

use pool::{configure, Readers, Role};
use rows::{to_json, MergedRow, RecordRow, SourceRow, MERGED_COLUMNS, RECORD_COLUMNS, SOURCE_COLUMNS};

/// Maps a rusqlite error onto the storage taxonomy.
pub(crate) fn sql_err(context: &str, e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => StorageError::Integrity(format!("{context}: {e}")),
            ErrorCode::ReadOnly => StorageError::ReadOnly,
            ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied => {
                StorageError::Connection(format!("{context}: {e}"))
            }
            _ if e.to_string().contains("no such table") => StorageError::SchemaUninitialized,
            _ => StorageError::Backend(format!("{context}: {e}")),
        },
        _ => StorageError::Backend(format!("{context}: {e}")),
    }
}

/// Configuration for a SQLite store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Read connections for file-backed databases.
    pub read_pool_size: usize,
    /// How long a connection waits on a locked database (milliseconds).
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            read_pool_size: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

impl SqliteConfig {
    const MAX_READERS: usize = 8;

    /// Checks bounds.
    ///
    /// # Errors
    /// Returns a configuration error if the pool size is outside `1..=8`.
    pub fn validate(self) -> Result<Self, NormalizerError> {
        if !(1..=Self::MAX_READERS).contains(&self.read_pool_size) {
            return Err(NormalizerError::config(format!(
                "read_pool_size must be between 1 and {} (got {})",
                Self::MAX_READERS,
                self.read_pool_size
            )));
        }
        Ok(self)
    }
}

/// SQLite-backed [`RecordStore`].
pub struct SqliteStore {
    writer: Mutex<Connection>,
    readers: Option<Readers>,
    path: Option<PathBuf>,
    merge_slot: JobSlot,
}

impl SqliteStore {
    /// Opens or creates the database at `path` and runs migrations.
    ///
    /// # Errors
    /// - `Connection` if the file cannot be opened
    pub fn open(path: impl AsRef<Path>, config: SqliteConfig) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| connection_err(path, &e))?;
        configure(&conn, Role::Writer, config.busy_timeout_ms)?;
        schema::run_migrations(&conn)?;
        let readers = Readers::open(path, config.read_pool_size, config.busy_timeout_ms)?;
        tracing::info!(path = %path.display(), readers = readers.count(), "opened sqlite store");
        Ok(Self::from_parts(conn, Some(readers), Some(path)))
    }

    /// Opens an existing database without creating or migrating anything.
    ///
    /// # Errors
    /// - `Connection` if the file does not exist or is not a database
    pub fn connect(path: impl AsRef<Path>, config: SqliteConfig) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| connection_err(path, &e))?;
        configure(&conn, Role::Writer, config.busy_timeout_ms)?;
        let readers = Readers::open(path, config.read_pool_size, config.busy_timeout_ms)?;
        Ok(Self::from_parts(conn, Some(readers), Some(path)))
    }

    /// Opens a private in-memory database with the schema applied.
    ///
    /// # Errors
    /// Returns a backend error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self::connect_in_memory()?;
        store.initialize_schema()?;
        Ok(store)
    }

    /// Opens a private in-memory database with no schema.
    ///
    /// # Errors
    /// Returns a backend error if SQLite cannot allocate the database.
    pub fn connect_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| sql_err("open in-memory database", e))?;
        configure(&conn, Role::Writer, 0)?;
        Ok(Self::from_parts(conn, None, None))
    }

    fn from_parts(conn: Connection, readers: Option<Readers>, path: Option<&Path>) -> Self {
        Self {
            writer: Mutex::new(conn),
            readers,
            path: path.map(Path::to_path_buf),
            merge_slot: JobSlot::default(),
        }
    }

    /// Database file path, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: sqlite.writer".to_string()))
    }

    /// Runs a read on the pool, or on the writer for in-memory databases.
    fn with_reader<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        match &self.readers {
            Some(readers) => readers.read(f),
            None => f(&*self.writer()?),
        }
    }

    /// Runs `f` inside one IMMEDIATE transaction with deferred foreign keys.
    /// Commits only if `f` succeeds and no foreign key is violated.
    fn write_batch<F>(&self, context: &'static str, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&Connection) -> Result<(), StorageError>,
    {
        let mut conn = self.writer()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sql_err(context, e))?;
        if !schema::is_initialized(&tx)? {
            return Err(StorageError::SchemaUninitialized);
        }
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")
            .map_err(|e| sql_err(context, e))?;

        f(&tx)?;

        let violation: Option<String> = tx
            .query_row("PRAGMA foreign_key_check", [], |row| row.get(0))
            .optional()
            .map_err(|e| sql_err(context, e))?;
        if let Some(table) = violation {
            return Err(StorageError::Integrity(format!(
                "{context}: foreign key violation in {table}"
            )));
        }
        tx.commit().map_err(|e| sql_err(context, e))
    }

    fn replace_merged(&self, expected_generation: Option<u64>, concepts: &[MergedConcept]) -> Result<(), StorageError> {
        check_merged_batch(concepts)?;
        self.write_batch("replace merged concepts", |conn| {
            if let Some(expected) = expected_generation {
                let actual = schema::records_generation(conn)?;
                if actual != expected {
                    return Err(stale_generation(expected, actual));
                }
            }
            // ON DELETE SET NULL clears every merge_ref
            conn.execute("DELETE FROM gene_merged", [])
                .map_err(|e| sql_err("delete merged concepts", e))?;
            for concept in concepts {
                insert_merged(conn, concept)?;
            }
            Ok(())
        })
    }
}

fn replace_source_rows(conn: &Connection, source: SourceName, records: &[GeneRecord]) -> Result<(), StorageError> {
    conn.execute("DELETE FROM gene_concepts WHERE source = ?1", params![source.as_str()])
        .map_err(|e| sql_err("delete previous generation", e))?;
    schema::drop_lookup_indexes(conn)?;
    for record in records {
        insert_record(conn, record)?;
    }
    schema::create_lookup_indexes(conn)?;
    schema::bump_records_generation(conn)
}

fn upsert_metadata(conn: &Connection, source: SourceName, meta: &SourceMeta) -> Result<(), StorageError> {
    let data_url = to_json(&meta.data_url)?;
    let assemblies = to_json(&meta.genome_assemblies)?;
    conn.execute(
        "INSERT INTO gene_sources (name, data_license, data_license_url, version, data_url, rdp_url, \
         data_license_nc, data_license_sa, data_license_attr, genome_assemblies) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT (name) DO UPDATE SET data_license = excluded.data_license, \
         data_license_url = excluded.data_license_url, version = excluded.version, \
         data_url = excluded.data_url, rdp_url = excluded.rdp_url, \
         data_license_nc = excluded.data_license_nc, data_license_sa = excluded.data_license_sa, \
         data_license_attr = excluded.data_license_attr, genome_assemblies = excluded.genome_assemblies",
        params![
            source.as_str(),
            meta.data_license,
            meta.data_license_url,
            meta.version,
            data_url,
            meta.rdp_url,
            meta.data_license_attributes.non_commercial,
            meta.data_license_attributes.share_alike,
            meta.data_license_attributes.attribution,
            assemblies,
        ],
    )
    .map_err(|e| sql_err("put source metadata", e))?;
    Ok(())
}

fn connection_err(path: &Path, e: &rusqlite::Error) -> StorageError {
    StorageError::Connection(format!("failed to open {}: {e}", path.display()))
}

fn insert_record(conn: &Connection, record: &GeneRecord) -> Result<(), StorageError> {
    let annotations = to_json(&record.location_annotations)?;
    let locations = to_json(&record.locations)?;
    let id = record.concept_id.as_str();
    conn.prepare_cached(
        "INSERT INTO gene_concepts (concept_id, source, symbol, symbol_status, label, strand, gene_type, \
         location_annotations, locations) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )
    .and_then(|mut stmt| {
        stmt.execute(params![
            id,
            record.source.as_str(),
            record.symbol,
            record.symbol_status.map(SymbolStatus::as_str),
            record.label,
            record.strand.map(Strand::as_str),
            record.gene_type,
            annotations,
            locations,
        ])
    })
    .map_err(|e| sql_err("insert record", e))?;

    let mut stmt = conn
        .prepare_cached("INSERT INTO gene_previous_symbols (prev_symbol, ordinal, concept_id) VALUES (?1, ?2, ?3)")
        .map_err(|e| sql_err("gene_previous_symbols", e))?;
    for (ordinal, symbol) in (0_i64..).zip(&record.previous_symbols) {
        stmt.execute(params![symbol, ordinal, id])
            .map_err(|e| sql_err("gene_previous_symbols", e))?;
    }
    insert_children(conn, "gene_aliases", "alias", id, record.aliases.iter().map(String::as_str))?;
    insert_children(conn, "gene_xrefs", "xref", id, record.xrefs.iter().map(ConceptId::as_str))?;
    insert_children(
        conn,
        "gene_associations",
        "associated_with",
        id,
        record.associated_with.iter().map(ConceptId::as_str),
    )
}

fn insert_children<'a>(
    conn: &Connection,
    table: &str,
    column: &str,
    concept_id: &str,
    values: impl Iterator<Item = &'a str>,
) -> Result<(), StorageError> {
    let sql = format!("INSERT INTO {table} ({column}, concept_id) VALUES (?1, ?2)");
    let mut stmt = conn.prepare_cached(&sql).map_err(|e| sql_err(table, e))?;
    for value in values {
        stmt.execute(params![value, concept_id])
            .map_err(|e| sql_err(table, e))?;
    }
    Ok(())
}

fn insert_merged(conn: &Connection, concept: &MergedConcept) -> Result<(), StorageError> {
    let json = [
        to_json(&concept.members)?,
        to_json(&concept.location_annotations)?,
        to_json(&concept.locations)?,
        to_json(&concept.gene_types)?,
        to_json(&concept.previous_symbols)?,
        to_json(&concept.aliases)?,
        to_json(&concept.xrefs)?,
        to_json(&concept.associated_with)?,
    ];
    conn.prepare_cached(
        "INSERT INTO gene_merged (concept_id, members, symbol, symbol_status, label, strand, gene_type, \
         location_annotations, locations, gene_types, previous_symbols, aliases, xrefs, associated_with) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )
    .and_then(|mut stmt| {
        stmt.execute(params![
            concept.concept_id.as_str(),
            json[0],
            concept.symbol,
            concept.symbol_status.map(SymbolStatus::as_str),
            concept.label,
            concept.strand.map(Strand::as_str),
            concept.gene_type,
            json[1],
            json[2],
            json[3],
            json[4],
            json[5],
            json[6],
            json[7],
        ])
    })
    .map_err(|e| sql_err("insert merged concept", e))?;

    let mut stmt = conn
        .prepare_cached("UPDATE gene_concepts SET merge_ref = ?1 WHERE lower(concept_id) = ?2")
        .map_err(|e| sql_err("set merge_ref", e))?;
    for member in &concept.members {
        let updated = stmt
            .execute(params![concept.concept_id.as_str(), member.key()])
            .map_err(|e| sql_err("set merge_ref", e))?;
        if updated == 0 {
            return Err(StorageError::Integrity(format!(
                "merged concept {} lists unknown member {member}",
                concept.concept_id
            )));
        }
    }
    Ok(())
}

fn lookup_sql(field: LookupField) -> &'static str {
    match field {
        LookupField::Symbol => "SELECT DISTINCT concept_id FROM gene_concepts WHERE lower(symbol) = ?1 ORDER BY concept_id",
        LookupField::PreviousSymbol => {
            "SELECT DISTINCT concept_id FROM gene_previous_symbols WHERE lower(prev_symbol) = ?1 ORDER BY concept_id"
        }
        LookupField::Alias => "SELECT DISTINCT concept_id FROM gene_aliases WHERE lower(alias) = ?1 ORDER BY concept_id",
        LookupField::Xref => "SELECT DISTINCT concept_id FROM gene_xrefs WHERE lower(xref) = ?1 ORDER BY concept_id",
        LookupField::AssociatedWith => {
            "SELECT DISTINCT concept_id FROM gene_associations WHERE lower(associated_with) = ?1 ORDER BY concept_id"
        }
    }
}

fn exists(conn: &Connection, sql: &str) -> Result<bool, StorageError> {
    conn.query_row(sql, [], |row| row.get(0))
        .map_err(|e| sql_err("check population", e))
}

impl RecordStore for SqliteStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn merge_slot(&self) -> &JobSlot {
        &self.merge_slot
    }

    fn merge_lock_file(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|path| {
            let mut name = path.as_os_str().to_owned();
            name.push(".merge.lock");
            PathBuf::from(name)
        })
    }

    fn initialize_schema(&self) -> Result<(), StorageError> {
        schema::run_migrations(&*self.writer()?)
    }

    fn check_schema_initialized(&self) -> Result<bool, StorageError> {
        self.with_reader(schema::is_initialized)
    }

    fn drop_schema(&self) -> Result<(), StorageError> {
        let mut conn = self.writer()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sql_err("drop schema", e))?;
        schema::drop_all(&tx)?;
        tx.commit().map_err(|e| sql_err("drop schema", e))?;
        tracing::warn!("dropped sqlite tables");
        Ok(())
    }

    fn records_generation(&self) -> Result<u64, StorageError> {
        self.with_reader(|conn| {
            if !schema::is_initialized(conn)? {
                return Err(StorageError::SchemaUninitialized);
            }
            schema::records_generation(conn)
        })
    }

    fn check_tables_populated(&self) -> Result<bool, StorageError> {
        self.with_reader(|conn| {
            if !schema::is_initialized(conn)? {
                return Ok(false);
            }
            let mut stmt = conn
                .prepare("SELECT name FROM gene_sources")
                .map_err(|e| sql_err("list sources", e))?;
            let names: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .and_then(|rows| rows.collect())
                .map_err(|e| sql_err("list sources", e))?;
            let sources: BTreeSet<SourceName> = names.iter().filter_map(|name| name.parse().ok()).collect();
            let has_records = exists(conn, "SELECT EXISTS (SELECT 1 FROM gene_concepts)")?;
            let has_merged = exists(conn, "SELECT EXISTS (SELECT 1 FROM gene_merged)")?;
            Ok(tables_populated(&sources, has_records, has_merged))
        })
    }

    fn put_records(&self, source: SourceName, records: Vec<GeneRecord>) -> Result<(), StorageError> {
        check_record_batch(source, &records)?;
        self.write_batch("replace source records", |conn| replace_source_rows(conn, source, &records))?;
        tracing::info!(%source, count = records.len(), "replaced source records");
        Ok(())
    }

    fn put_source(&self, source: SourceName, records: Vec<GeneRecord>, meta: SourceMeta) -> Result<(), StorageError> {
        check_record_batch(source, &records)?;
        self.write_batch("replace source", |conn| {
            replace_source_rows(conn, source, &records)?;
            upsert_metadata(conn, source, &meta)
        })?;
        tracing::info!(%source, count = records.len(), "replaced source records and metadata");
        Ok(())
    }

    fn put_merged(&self, concepts: Vec<MergedConcept>) -> Result<(), StorageError> {
        self.replace_merged(None, &concepts)?;
        tracing::info!(count = concepts.len(), "replaced merged concepts");
        Ok(())
    }

    fn put_merged_at(&self, generation: u64, concepts: Vec<MergedConcept>) -> Result<(), StorageError> {
        self.replace_merged(Some(generation), &concepts)?;
        tracing::info!(count = concepts.len(), generation, "replaced merged concepts");
        Ok(())
    }

    fn put_source_metadata(&self, source: SourceName, meta: SourceMeta) -> Result<(), StorageError> {
        self.write_batch("put source metadata", |conn| upsert_metadata(conn, source, &meta))
    }

    fn get_source_metadata(&self, source: SourceName) -> Result<Option<SourceMeta>, StorageError> {
        let row = self.with_reader(|conn| {
            conn.query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM gene_sources WHERE name = ?1"),
                params![source.as_str()],
                SourceRow::read,
            )
            .optional()
            .map_err(|e| sql_err("get source metadata", e))
        })?;
        row.map(SourceRow::decode).transpose()
    }

    fn get_by_concept_id(&self, concept_id: &str) -> Result<Option<GeneRecord>, StorageError> {
        let key = normalize_key(concept_id);
        let row = self.with_reader(|conn| {
            conn.query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM gene_record_lookup WHERE concept_key = ?1"),
                params![key],
                RecordRow::read,
            )
            .optional()
            .map_err(|e| sql_err("get record", e))
        })?;
        row.map(RecordRow::decode).transpose()
    }

    fn get_merged(&self, concept_id: &str) -> Result<Option<MergedConcept>, StorageError> {
        let key = normalize_key(concept_id);
        let row = self.with_reader(|conn| {
            conn.query_row(
                &format!("SELECT {MERGED_COLUMNS} FROM gene_merged WHERE lower(concept_id) = ?1"),
                params![key],
                MergedRow::read,
            )
            .optional()
            .map_err(|e| sql_err("get merged concept", e))
        })?;
        row.map(MergedRow::decode).transpose()
    }

    fn find_by_field(&self, field: LookupField, value: &str) -> Result<Vec<ConceptId>, StorageError> {
        let key = normalize_key(value);
        let ids: Vec<String> = self.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(lookup_sql(field))
                .map_err(|e| sql_err("find by field", e))?;
            let ids: Vec<String> = stmt
                .query_map(params![key], |row| row.get(0))
                .and_then(|rows| rows.collect())
                .map_err(|e| sql_err("find by field", e))?;
            Ok(ids)
        })?;
        ids.into_iter()
            .map(|id| ConceptId::parse(id).map_err(|e| StorageError::Serialization(e.to_string())))
            .collect()
    }

    fn scan_records(&self) -> Result<Vec<GeneRecord>, StorageError> {
        let rows: Vec<RecordRow> = self.with_reader(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {RECORD_COLUMNS} FROM gene_record_lookup ORDER BY concept_id"))
                .map_err(|e| sql_err("scan records", e))?;
            let rows: Vec<RecordRow> = stmt
                .query_map([], RecordRow::read)
                .and_then(|rows| rows.collect())
                .map_err(|e| sql_err("scan records", e))?;
            Ok(rows)
        })?;
        rows.into_iter().map(RecordRow::decode).collect()
    }

    fn scan_merged(&self) -> Result<Vec<MergedConcept>, StorageError> {
        let rows: Vec<MergedRow> = self.with_reader(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {MERGED_COLUMNS} FROM gene_merged ORDER BY concept_id"))
                .map_err(|e| sql_err("scan merged concepts", e))?;
            let rows: Vec<MergedRow> = stmt
                .query_map([], MergedRow::read)
                .and_then(|rows| rows.collect())
                .map_err(|e| sql_err("scan merged concepts", e))?;
            Ok(rows)
        })?;
        rows.into_iter().map(MergedRow::decode).collect()
    }

    fn all_concept_ids(&self) -> Result<Vec<ConceptId>, StorageError> {
        let ids: Vec<String> = self.with_reader(|conn| {
            let mut stmt = conn
                .prepare("SELECT concept_id FROM gene_concepts ORDER BY concept_id")
                .map_err(|e| sql_err("list concept ids", e))?;
            let ids: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .and_then(|rows| rows.collect())
                .map_err(|e| sql_err("list concept ids", e))?;
            Ok(ids)
        })?;
        ids.into_iter()
            .map(|id| ConceptId::parse(id).map_err(|e| StorageError::Serialization(e.to_string())))
            .collect()
    }

    fn delete_source(&self, source: SourceName) -> Result<(), StorageError> {
        self.write_batch("delete source", |conn| {
            conn.execute("DELETE FROM gene_concepts WHERE source = ?1", params![source.as_str()])
                .map_err(|e| sql_err("delete source records", e))?;
            conn.execute("DELETE FROM gene_sources WHERE name = ?1", params![source.as_str()])
                .map_err(|e| sql_err("delete source metadata", e))?;
            schema::bump_records_generation(conn)
        })?;
        tracing::info!(%source, "deleted source");
        Ok(())
    }

    fn delete_merged(&self) -> Result<(), StorageError> {
        self.write_batch("delete merged concepts", |conn| {
            conn.execute("DELETE FROM gene_merged", [])
                .map_err(|e| sql_err("delete merged concepts", e))?;
            Ok(())
        })
    }
}
