//! Durable key-value store recovery and the `gene-norm-check-db` and
//! `gene-norm-admin` binaries.
//!
//! Each test writes through one store instance, drops it, and reopens the
//! same directory to check what survived.

use std::fs::OpenOptions;
use std::process::Command;

use genenorm::{
    check_health, GeneRecord, KvConfig, KvStore, LookupField, MergeEngine, RecordStore, SourceMeta, SourceName,
    SourcePriority, SqliteConfig, SqliteStore, StorageError,
};

use tempfile::tempdir;

fn meta() -> SourceMeta {
    SourceMeta::new("custom", "https://example.org/license", "2024-01-01")
}

fn records(source: SourceName, ids: &[(&str, &str)]) -> Vec<GeneRecord> {
    ids.iter()
        .map(|(id, symbol)| GeneRecord::builder(source, id, symbol).alias("SHARED").build().unwrap())
        .collect()
}

fn populate(store: &dyn RecordStore) {
    store
        .put_records(SourceName::Hgnc, records(SourceName::Hgnc, &[("hgnc:1097", "BRAF"), ("hgnc:5", "A1BG")]))
        .unwrap();
    store
        .put_records(SourceName::Ensembl, records(SourceName::Ensembl, &[("ensembl:ENSG00000157764", "BRAF")]))
        .unwrap();
    store
        .put_records(SourceName::Ncbi, records(SourceName::Ncbi, &[("ncbigene:673", "BRAF")]))
        .unwrap();
    for source in SourceName::ALL {
        store.put_source_metadata(source, meta()).unwrap();
    }
    MergeEngine::new(SourcePriority::default()).run(store).unwrap();
}

/// Reopening a durable store yields exactly what was committed.
#[test]
fn test_reopen_preserves_contents() {
    let dir = tempdir().unwrap();

    let (records_before, merged_before) = {
        let store = KvStore::open(dir.path(), KvConfig::default()).unwrap();
        populate(&store);
        (
            store.scan_records().unwrap(),
            store.get_merged("hgnc:1097").unwrap(),
        )
    };

    let store = KvStore::open(dir.path(), KvConfig::default()).unwrap();
    assert_eq!(store.scan_records().unwrap(), records_before);
    assert_eq!(store.get_merged("hgnc:1097").unwrap(), merged_before);
    assert_eq!(store.get_source_metadata(SourceName::Ncbi).unwrap(), Some(meta()));
    assert_eq!(
        store.find_by_field(LookupField::Alias, "shared").unwrap().len(),
        4
    );
    assert!(check_health(&store).unwrap().is_healthy());
}

/// Reopening twice in a row replays nothing the second time and still matches.
#[test]
fn test_repeated_reopen_is_stable() {
    let dir = tempdir().unwrap();
    {
        let store = KvStore::open(dir.path(), KvConfig::default()).unwrap();
        populate(&store);
    }
    let first = {
        let store = KvStore::open(dir.path(), KvConfig::default()).unwrap();
        store.scan_records().unwrap()
    };
    let store = KvStore::connect(dir.path(), KvConfig::default()).unwrap();
    assert_eq!(store.scan_records().unwrap(), first);
}

/// A torn final WAL entry is dropped; every earlier batch survives.
#[test]
fn test_torn_wal_tail_is_survived() {
    let dir = tempdir().unwrap();
    {
        let store = KvStore::open(dir.path(), KvConfig::default()).unwrap();
        store
            .put_records(SourceName::Hgnc, records(SourceName::Hgnc, &[("hgnc:1097", "BRAF")]))
            .unwrap();
        store.put_source_metadata(SourceName::Hgnc, meta()).unwrap();
    }

    let wal = dir.path().join("store.wal");
    let len = std::fs::metadata(&wal).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&wal)
        .unwrap()
        .set_len(len - 3)
        .unwrap();

    let store = KvStore::open(dir.path(), KvConfig::default()).unwrap();
    assert!(store.get_by_concept_id("hgnc:1097").unwrap().is_some());
    assert!(store.get_source_metadata(SourceName::Hgnc).unwrap().is_none());

    // the recovered store keeps accepting writes
    store.put_source_metadata(SourceName::Hgnc, meta()).unwrap();
    drop(store);
    let store = KvStore::open(dir.path(), KvConfig::default()).unwrap();
    assert_eq!(store.get_source_metadata(SourceName::Hgnc).unwrap(), Some(meta()));
}

/// Compaction under a tiny WAL limit loses nothing.
#[test]
fn test_compaction_preserves_contents() {
    let dir = tempdir().unwrap();
    let config = KvConfig {
        max_wal_size: 4 * 1024,
        ..KvConfig::default()
    };
    {
        let store = KvStore::open(dir.path(), config.clone()).unwrap();
        for round in 0..20 {
            let batch: Vec<GeneRecord> = (0..10)
                .map(|i| {
                    GeneRecord::builder(SourceName::Ncbi, &format!("ncbigene:{}", round * 100 + i), "GENE")
                        .alias(&format!("ALIAS{round}"))
                        .build()
                        .unwrap()
                })
                .collect();
            store.put_records(SourceName::Ncbi, batch).unwrap();
        }
    }

    let store = KvStore::open(dir.path(), config).unwrap();
    assert_eq!(store.scan_records().unwrap().len(), 10);
    assert_eq!(store.find_by_field(LookupField::Alias, "alias19").unwrap().len(), 10);
    assert!(store.find_by_field(LookupField::Alias, "alias0").unwrap().is_empty());
}

#[test]
fn test_check_db_binary_reports_healthy_kv_store() {
    let dir = tempdir().unwrap();
    {
        let store = KvStore::open(dir.path(), KvConfig::default()).unwrap();
        populate(&store);
    }

    let status = Command::new(env!("CARGO_BIN_EXE_gene-norm-check-db"))
        .arg("--db-url")
        .arg(format!("kv://{}", dir.path().display()))
        .arg("--quiet")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_check_db_binary_runs_beside_open_writer() {
    let dir = tempdir().unwrap();
    let store = KvStore::open(dir.path(), KvConfig::default()).unwrap();
    populate(&store);

    let status = Command::new(env!("CARGO_BIN_EXE_gene-norm-check-db"))
        .arg("--db-url")
        .arg(format!("kv://{}", dir.path().display()))
        .arg("--quiet")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));

    // the writer is untouched and keeps working
    store.put_source_metadata(SourceName::Hgnc, meta()).unwrap();
    assert!(check_health(&store).unwrap().is_healthy());
}

#[test]
fn test_read_only_store_refuses_writes() {
    let dir = tempdir().unwrap();
    let writer = KvStore::open(dir.path(), KvConfig::default()).unwrap();
    populate(&writer);

    let reader = KvStore::connect_read_only(dir.path()).unwrap();
    assert_eq!(reader.scan_records().unwrap(), writer.scan_records().unwrap());
    assert_eq!(
        reader.put_source_metadata(SourceName::Hgnc, meta()).unwrap_err(),
        StorageError::ReadOnly
    );
}

#[test]
fn test_admin_binary_exports_and_restores() {
    let dir = tempdir().unwrap();
    let kv = dir.path().join("kv");
    {
        let store = KvStore::open(&kv, KvConfig::default()).unwrap();
        populate(&store);
    }
    let dump = dir.path().join("genes.json");
    let sqlite = dir.path().join("genes.db");

    let export = Command::new(env!("CARGO_BIN_EXE_gene-norm-admin"))
        .arg("--db-url")
        .arg(format!("kv://{}", kv.display()))
        .arg("export")
        .arg(&dump)
        .status()
        .unwrap();
    assert_eq!(export.code(), Some(0));

    let restore = Command::new(env!("CARGO_BIN_EXE_gene-norm-admin"))
        .arg("--db-url")
        .arg(format!("sqlite://{}", sqlite.display()))
        .arg("restore")
        .arg(&dump)
        .status()
        .unwrap();
    assert_eq!(restore.code(), Some(0));

    let store = SqliteStore::connect(&sqlite, SqliteConfig::default()).unwrap();
    assert!(check_health(&store).unwrap().is_healthy());
    assert_eq!(store.find_by_field(LookupField::Alias, "shared").unwrap().len(), 4);
}

#[test]
fn test_admin_binary_drop_needs_confirmation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("genes.db");
    {
        let store = SqliteStore::open(&path, SqliteConfig::default()).unwrap();
        populate(&store);
    }
    let url = format!("sqlite://{}", path.display());

    let refused = Command::new(env!("CARGO_BIN_EXE_gene-norm-admin"))
        .args(["--db-url", &url, "drop"])
        .status()
        .unwrap();
    assert_eq!(refused.code(), Some(1));
    assert!(SqliteStore::connect(&path, SqliteConfig::default())
        .unwrap()
        .check_schema_initialized()
        .unwrap());

    let dropped = Command::new(env!("CARGO_BIN_EXE_gene-norm-admin"))
        .args(["--db-url", &url, "drop", "--yes"])
        .status()
        .unwrap();
    assert_eq!(dropped.code(), Some(0));
    assert!(!SqliteStore::connect(&path, SqliteConfig::default())
        .unwrap()
        .check_schema_initialized()
        .unwrap());
}

#[test]
fn test_admin_binary_updates_then_merges() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("genes.db");
    let hgnc = dir.path().join("hgnc.json");
    std::fs::write(
        &hgnc,
        serde_json::json!({
            "metadata": {
                "data_license": "CC0",
                "data_license_url": "https://www.genenames.org/about/license/",
                "version": "20240101",
                "data_license_attributes": {"non_commercial": false, "share_alike": false, "attribution": false}
            },
            "records": [{"concept_id": "hgnc:1097", "symbol": "BRAF"}]
        })
        .to_string(),
    )
    .unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_gene-norm-admin"))
        .arg("--db-url")
        .arg(format!("sqlite://{}", path.display()))
        .arg("update")
        .arg("--load")
        .arg(format!("hgnc={}", hgnc.display()))
        .arg("--merge")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));

    let store = SqliteStore::connect(&path, SqliteConfig::default()).unwrap();
    assert!(store.get_merged("hgnc:1097").unwrap().is_some());
    assert!(store.get_source_metadata(SourceName::Hgnc).unwrap().is_some());
}

#[test]
fn test_check_db_binary_reports_unpopulated_sqlite_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("genes.db");
    {
        let store = SqliteStore::open(&path, SqliteConfig::default()).unwrap();
        store
            .put_records(SourceName::Hgnc, records(SourceName::Hgnc, &[("hgnc:1097", "BRAF")]))
            .unwrap();
    }

    let status = Command::new(env!("CARGO_BIN_EXE_gene-norm-check-db"))
        .env("GENE_NORM_DB_URL", format!("sqlite://{}", path.display()))
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_check_db_binary_fails_on_missing_store() {
    let dir = tempdir().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_gene-norm-check-db"))
        .arg("--db-url")
        .arg(format!("kv://{}", dir.path().join("absent").display()))
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}
