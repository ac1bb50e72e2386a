//! Relational schema and migrations.
//!
//! Versions are tracked in `PRAGMA user_version`. Every migration is
//! idempotent DDL run inside one transaction together with the version bump.

use rusqlite::Connection;

use crate::storage::traits::StorageError;

use super::sql_err;

/// Schema version written by the latest migration.
pub const SCHEMA_VERSION: i64 = 2;

/// Tables and views that must exist for the schema to count as initialized.
const REQUIRED_OBJECTS: [&str; 9] = [
    "gene_store_state",
    "gene_sources",
    "gene_merged",
    "gene_concepts",
    "gene_previous_symbols",
    "gene_aliases",
    "gene_xrefs",
    "gene_associations",
    "gene_record_lookup",
];

/// Case-insensitive lookup indexes. Dropped before a bulk per-source insert
/// and rebuilt after it.
const LOOKUP_INDEXES: [(&str, &str); 5] = [
    ("idx_gc_symbol_low", "gene_concepts (lower(symbol))"),
    ("idx_gps_prev_symbol_low", "gene_previous_symbols (lower(prev_symbol))"),
    ("idx_ga_alias_low", "gene_aliases (lower(alias))"),
    ("idx_gx_xref_low", "gene_xrefs (lower(xref))"),
    ("idx_gas_associated_with_low", "gene_associations (lower(associated_with))"),
];

type Migration = fn(&Connection) -> Result<(), StorageError>;

const MIGRATIONS: [(i64, Migration); 2] = [(1, v001_initial), (2, v002_store_state)];

/// Brings the schema up to [`SCHEMA_VERSION`].
pub fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| sql_err("read schema version", e))?;

    for (version, migrate) in MIGRATIONS {
        if version <= current {
            continue;
        }
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| sql_err("begin migration", e))?;
        migrate(&tx)?;
        tx.pragma_update(None, "user_version", version)
            .map_err(|e| sql_err("bump schema version", e))?;
        tx.commit().map_err(|e| sql_err("commit migration", e))?;
        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

/// Whether every required table and view exists.
pub fn is_initialized(conn: &Connection) -> Result<bool, StorageError> {
    let placeholders = vec!["?"; REQUIRED_OBJECTS.len()].join(", ");
    let sql = format!(
        "SELECT count(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name IN ({placeholders})"
    );
    let found: i64 = conn
        .query_row(&sql, rusqlite::params_from_iter(REQUIRED_OBJECTS), |row| row.get(0))
        .map_err(|e| sql_err("check schema", e))?;
    Ok(usize::try_from(found).is_ok_and(|n| n == REQUIRED_OBJECTS.len()))
}

/// Drops every object the migrations created and resets the version.
pub fn drop_all(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        DROP VIEW IF EXISTS gene_record_lookup;
        DROP TABLE IF EXISTS gene_previous_symbols;
        DROP TABLE IF EXISTS gene_aliases;
        DROP TABLE IF EXISTS gene_xrefs;
        DROP TABLE IF EXISTS gene_associations;
        DROP TABLE IF EXISTS gene_concepts;
        DROP TABLE IF EXISTS gene_merged;
        DROP TABLE IF EXISTS gene_sources;
        DROP TABLE IF EXISTS gene_store_state;
        PRAGMA user_version = 0;
        ",
    )
    .map_err(|e| sql_err("drop schema", e))
}

/// Current records generation.
pub fn records_generation(conn: &Connection) -> Result<u64, StorageError> {
    let generation: i64 = conn
        .query_row("SELECT records_generation FROM gene_store_state WHERE id = 1", [], |row| row.get(0))
        .map_err(|e| sql_err("read records generation", e))?;
    u64::try_from(generation).map_err(|_| StorageError::Backend(format!("negative records generation {generation}")))
}

/// Marks the record set as changed.
pub fn bump_records_generation(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE gene_store_state SET records_generation = records_generation + 1 WHERE id = 1",
        [],
    )
    .map_err(|e| sql_err("bump records generation", e))?;
    Ok(())
}

pub fn drop_lookup_indexes(conn: &Connection) -> Result<(), StorageError> {
    for (name, _) in LOOKUP_INDEXES {
        conn.execute_batch(&format!("DROP INDEX IF EXISTS {name};"))
            .map_err(|e| sql_err("drop lookup index", e))?;
    }
    Ok(())
}

pub fn create_lookup_indexes(conn: &Connection) -> Result<(), StorageError> {
    for (name, target) in LOOKUP_INDEXES {
        conn.execute_batch(&format!("CREATE INDEX IF NOT EXISTS {name} ON {target};"))
            .map_err(|e| sql_err("create lookup index", e))?;
    }
    Ok(())
}

fn v001_initial(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS gene_sources (
            name                TEXT PRIMARY KEY,
            data_license        TEXT NOT NULL,
            data_license_url    TEXT NOT NULL,
            version             TEXT NOT NULL,
            data_url            TEXT NOT NULL DEFAULT '{}',
            rdp_url             TEXT,
            data_license_nc     INTEGER NOT NULL DEFAULT 0,
            data_license_sa     INTEGER NOT NULL DEFAULT 0,
            data_license_attr   INTEGER NOT NULL DEFAULT 0,
            genome_assemblies   TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS gene_merged (
            concept_id              TEXT PRIMARY KEY,
            members                 TEXT NOT NULL,
            symbol                  TEXT,
            symbol_status           TEXT,
            label                   TEXT,
            strand                  TEXT,
            gene_type               TEXT,
            location_annotations    TEXT NOT NULL DEFAULT '[]',
            locations               TEXT NOT NULL DEFAULT '{}',
            gene_types              TEXT NOT NULL DEFAULT '{}',
            previous_symbols        TEXT NOT NULL DEFAULT '[]',
            aliases                 TEXT NOT NULL DEFAULT '[]',
            xrefs                   TEXT NOT NULL DEFAULT '[]',
            associated_with         TEXT NOT NULL DEFAULT '[]'
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_gm_concept_id_low ON gene_merged (lower(concept_id));

        CREATE TABLE IF NOT EXISTS gene_concepts (
            concept_id              TEXT PRIMARY KEY,
            source                  TEXT NOT NULL,
            symbol                  TEXT NOT NULL,
            symbol_status           TEXT,
            label                   TEXT,
            strand                  TEXT,
            gene_type               TEXT,
            location_annotations    TEXT NOT NULL DEFAULT '[]',
            locations               TEXT NOT NULL DEFAULT '[]',
            merge_ref               TEXT REFERENCES gene_merged (concept_id) ON DELETE SET NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_gc_concept_id_low ON gene_concepts (lower(concept_id));
        CREATE INDEX IF NOT EXISTS idx_gc_source ON gene_concepts (source);
        CREATE INDEX IF NOT EXISTS idx_gc_merge_ref ON gene_concepts (merge_ref);

        CREATE TABLE IF NOT EXISTS gene_previous_symbols (
            id              INTEGER PRIMARY KEY,
            prev_symbol     TEXT NOT NULL,
            ordinal         INTEGER NOT NULL,
            concept_id      TEXT NOT NULL REFERENCES gene_concepts (concept_id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_gps_concept ON gene_previous_symbols (concept_id);

        CREATE TABLE IF NOT EXISTS gene_aliases (
            id              INTEGER PRIMARY KEY,
            alias           TEXT NOT NULL,
            concept_id      TEXT NOT NULL REFERENCES gene_concepts (concept_id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_ga_concept ON gene_aliases (concept_id);

        CREATE TABLE IF NOT EXISTS gene_xrefs (
            id              INTEGER PRIMARY KEY,
            xref            TEXT NOT NULL,
            concept_id      TEXT NOT NULL REFERENCES gene_concepts (concept_id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_gx_concept ON gene_xrefs (concept_id);

        CREATE TABLE IF NOT EXISTS gene_associations (
            id              INTEGER PRIMARY KEY,
            associated_with TEXT NOT NULL,
            concept_id      TEXT NOT NULL REFERENCES gene_concepts (concept_id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_gas_concept ON gene_associations (concept_id);

        CREATE VIEW IF NOT EXISTS gene_record_lookup AS
        SELECT
            lower(gc.concept_id) AS concept_key,
            gc.concept_id,
            gc.source,
            gc.symbol,
            gc.symbol_status,
            gc.label,
            gc.strand,
            gc.gene_type,
            gc.location_annotations,
            gc.locations,
            gc.merge_ref,
            (SELECT json_group_array(json_array(ps.ordinal, ps.prev_symbol))
                FROM gene_previous_symbols ps WHERE ps.concept_id = gc.concept_id) AS previous_symbols,
            (SELECT json_group_array(ga.alias)
                FROM gene_aliases ga WHERE ga.concept_id = gc.concept_id) AS aliases,
            (SELECT json_group_array(gx.xref)
                FROM gene_xrefs gx WHERE gx.concept_id = gc.concept_id) AS xrefs,
            (SELECT json_group_array(gas.associated_with)
                FROM gene_associations gas WHERE gas.concept_id = gc.concept_id) AS associated_with
        FROM gene_concepts gc;
        ",
    )
    .map_err(|e| sql_err("v001 initial schema", e))?;
    create_lookup_indexes(conn)
}

fn v002_store_state(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS gene_store_state (
            id                  INTEGER PRIMARY KEY CHECK (id = 1),
            records_generation  INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO gene_store_state (id, records_generation) VALUES (1, 0);
        ",
    )
    .map_err(|e| sql_err("v002 store state", e))
}
