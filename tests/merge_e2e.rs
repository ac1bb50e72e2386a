//! End-to-end merge passes over a store loaded from all three sources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use genenorm::{
    load_source, ConceptId, GeneRecord, GeneRecordDraft, JobSlot, KvStore, LookupField, MergeEngine, MergeError,
    MergedConcept, NormalizerConfig, RecordStore, SourceLoad, SourceMeta, SourceName, SourcePriority, SqliteConfig,
    SqliteStore, StorageError, StoreConfig, Strand,
};

use proptest::prelude::*;

fn draft(id: &str, symbol: &str, xrefs: &[&str]) -> GeneRecordDraft {
    GeneRecordDraft {
        concept_id: Some(id.to_string()),
        symbol: Some(symbol.to_string()),
        xrefs: xrefs.iter().map(|x| (*x).to_string()).collect(),
        ..GeneRecordDraft::default()
    }
}

fn load(store: &dyn RecordStore, source: SourceName, records: Vec<GeneRecordDraft>) {
    let report = load_source(
        store,
        source,
        SourceLoad {
            metadata: SourceMeta::new("custom", "https://example.org/license", "1"),
            records,
        },
    )
    .unwrap();
    assert!(report.rejected.is_empty(), "{:?}", report.rejected);
}

/// BRAF in all three sources plus A1BG in two and an orphan Ensembl gene.
fn load_fixture(store: &dyn RecordStore) {
    let mut hgnc_braf = draft(
        "hgnc:1097",
        "BRAF",
        &["ensembl:ENSG00000157764", "ncbigene:673"],
    );
    hgnc_braf.label = Some("B-Raf proto-oncogene, serine/threonine kinase".to_string());
    hgnc_braf.gene_type = Some("gene with protein product".to_string());
    hgnc_braf.previous_symbols = vec!["BRAF1".to_string()];
    hgnc_braf.aliases = vec!["NS7".to_string(), "RAFB1".to_string(), "B-RAF1".to_string()];
    hgnc_braf.associated_with = vec!["omim:164757".to_string()];
    load(
        store,
        SourceName::Hgnc,
        vec![hgnc_braf, draft("hgnc:5", "A1BG", &["ncbigene:1"])],
    );

    let mut ensembl_braf = draft("ensembl:ENSG00000157764", "BRAF", &["hgnc:1097"]);
    ensembl_braf.strand = Some(Strand::Reverse);
    ensembl_braf.gene_type = Some("protein_coding".to_string());
    load(
        store,
        SourceName::Ensembl,
        vec![
            ensembl_braf,
            draft("ensembl:ENSG00000284662", "OR4F16", &["hgnc:99999"]),
        ],
    );

    let mut ncbi_braf = draft("ncbigene:673", "BRAF", &["hgnc:1097"]);
    ncbi_braf.strand = Some(Strand::Forward);
    ncbi_braf.gene_type = Some("protein-coding".to_string());
    ncbi_braf.previous_symbols = vec!["BRAF1".to_string(), "B-RAF".to_string()];
    ncbi_braf.aliases = vec!["B-RAF1".to_string(), "BRAF-1".to_string()];
    load(
        store,
        SourceName::Ncbi,
        vec![ncbi_braf, draft("ncbigene:1", "A1BG", &[])],
    );
}

fn id(value: &str) -> ConceptId {
    ConceptId::parse(value).unwrap()
}

fn assert_braf_merged(store: &dyn RecordStore) {
    let engine = MergeEngine::new(SourcePriority::default());
    let report = engine.run(store).unwrap();

    assert_eq!(report.records, 6);
    assert_eq!(report.concepts, 3);
    assert_eq!(report.grouped, 2);
    assert_eq!(report.singletons, 1);
    assert_eq!(report.dangling.len(), 1);
    assert_eq!(report.dangling[0].from.as_str(), "ensembl:ENSG00000284662");
    assert_eq!(report.dangling[0].to.as_str(), "hgnc:99999");
    assert!(report.finished_at >= report.started_at);

    let braf = store.get_merged("HGNC:1097").unwrap().unwrap();
    assert_eq!(braf.concept_id.as_str(), "hgnc:1097");
    assert_eq!(braf.members.len(), 3);
    for member in ["hgnc:1097", "ensembl:ENSG00000157764", "ncbigene:673"] {
        assert!(braf.has_member(member), "{member}");
        let record = store.get_by_concept_id(member).unwrap().unwrap();
        assert_eq!(record.merge_ref, Some(id("hgnc:1097")), "{member}");
    }

    assert_eq!(braf.symbol.as_deref(), Some("BRAF"));
    assert_eq!(
        braf.label.as_deref(),
        Some("B-Raf proto-oncogene, serine/threonine kinase")
    );
    // HGNC has no strand, Ensembl outranks NCBI
    assert_eq!(braf.strand, Some(Strand::Reverse));
    assert_eq!(braf.previous_symbols, vec!["BRAF1".to_string(), "B-RAF".to_string()]);
    for alias in ["NS7", "RAFB1", "B-RAF1", "BRAF-1"] {
        assert!(braf.aliases.contains(alias), "{alias}");
    }
    assert_eq!(
        braf.xrefs.iter().map(ConceptId::as_str).collect::<Vec<_>>(),
        vec!["ensembl:ENSG00000157764", "ncbigene:673"]
    );
    assert!(braf.associated_with.contains(&id("omim:164757")));
    assert_eq!(
        braf.gene_types_for(SourceName::Ensembl)
            .map(|types| types.iter().cloned().collect::<Vec<_>>()),
        Some(vec!["protein_coding".to_string()])
    );

    let a1bg = store.get_merged("hgnc:5").unwrap().unwrap();
    assert!(a1bg.has_member("ncbigene:1"));
    assert!(!a1bg.has_member("hgnc:1097"));

    let orphan = store.get_merged("ensembl:ENSG00000284662").unwrap().unwrap();
    assert_eq!(orphan.members, vec![id("ensembl:ENSG00000284662")]);
    assert!(orphan.xrefs.contains(&id("hgnc:99999")));

    assert!(store.check_tables_populated().unwrap());
}

#[test]
fn test_braf_merge_on_kv_store() {
    let store = KvStore::open_in_memory();
    load_fixture(&store);
    assert_braf_merged(&store);
}

#[test]
fn test_braf_merge_on_sqlite_store() {
    let store = SqliteStore::open_in_memory().unwrap();
    load_fixture(&store);
    assert_braf_merged(&store);
}

#[test]
fn test_rerun_is_idempotent() {
    let store = KvStore::open_in_memory();
    load_fixture(&store);
    let engine = MergeEngine::new(SourcePriority::default());

    let first = engine.run(&store).unwrap();
    let concepts_after_first = store.get_merged("hgnc:1097").unwrap();
    let second = engine.run(&store).unwrap();

    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(store.get_merged("hgnc:1097").unwrap(), concepts_after_first);
}

#[test]
fn test_reload_then_merge_regroups() {
    let store = SqliteStore::open_in_memory().unwrap();
    load_fixture(&store);
    let engine = MergeEngine::new(SourcePriority::default());
    engine.run(&store).unwrap();

    // NCBI drops its BRAF record
    load(&store, SourceName::Ncbi, vec![draft("ncbigene:1", "A1BG", &[])]);
    let report = engine.run(&store).unwrap();

    let braf = store.get_merged("hgnc:1097").unwrap().unwrap();
    assert!(!braf.has_member("ncbigene:673"));
    assert_eq!(report.records, 5);
    assert_eq!(report.dangling.len(), 2);
}

#[test]
fn test_priority_order_picks_canonical() {
    let store = KvStore::open_in_memory();
    load_fixture(&store);
    let priority = SourcePriority::new(vec![SourceName::Ncbi, SourceName::Ensembl, SourceName::Hgnc]).unwrap();
    MergeEngine::new(priority).run(&store).unwrap();

    let braf = store.get_merged("ncbigene:673").unwrap().unwrap();
    assert!(braf.has_member("hgnc:1097"));
    assert!(store.get_merged("hgnc:1097").unwrap().is_none());
    // NCBI now wins the strand
    assert_eq!(braf.strand, Some(Strand::Forward));
}

#[test]
fn test_engines_from_one_config_share_the_store_lock() {
    let config = NormalizerConfig::default();
    let store = config.open_store().unwrap();
    load_fixture(store.as_ref());

    let first = config.merge_engine();
    let held = first.lock().try_acquire(store.as_ref()).unwrap();
    let err = config.merge_engine().run(store.as_ref()).unwrap_err();
    assert_eq!(err, MergeError::AlreadyRunning);
    drop(held);

    assert!(config.merge_engine().run(store.as_ref()).is_ok());
}

#[test]
fn test_concurrent_engines_on_one_store_never_overlap() {
    let store: Arc<dyn RecordStore> = Arc::new(KvStore::open_in_memory());
    load_fixture(store.as_ref());

    let held = MergeEngine::default().lock().try_acquire(store.as_ref()).unwrap();
    let results: Vec<Result<_, MergeError>> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || MergeEngine::default().run(store.as_ref()))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    drop(held);

    assert!(results.iter().all(|r| r.as_ref().unwrap_err() == &MergeError::AlreadyRunning));
}

#[test]
fn test_sqlite_file_opened_twice_shares_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("genes.db");
    let a = SqliteStore::open(&path, SqliteConfig::default()).unwrap();
    load_fixture(&a);
    let b = SqliteStore::connect(&path, SqliteConfig::default()).unwrap();

    let _held = MergeEngine::default().lock().try_acquire(&a).unwrap();
    assert_eq!(MergeEngine::default().run(&b).unwrap_err(), MergeError::AlreadyRunning);
}

#[test]
fn test_kv_dir_config_engines_share_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let config = NormalizerConfig {
        store: StoreConfig::KvDir(dir.path().to_path_buf()),
        ..NormalizerConfig::default()
    };
    let store = config.open_store().unwrap();
    load_fixture(store.as_ref());

    let _held = config.merge_engine().lock().try_acquire(store.as_ref()).unwrap();
    assert_eq!(
        config.merge_engine().run(store.as_ref()).unwrap_err(),
        MergeError::AlreadyRunning
    );
}

/// Reloads NCBI the first time the merge engine scans records, as a loader
/// running in another process would.
struct ReloadDuringScan<S> {
    inner: S,
    reloaded: AtomicBool,
}

impl<S: RecordStore> RecordStore for ReloadDuringScan<S> {
    fn backend(&self) -> genenorm::BackendKind {
        self.inner.backend()
    }
    fn merge_slot(&self) -> &JobSlot {
        self.inner.merge_slot()
    }
    fn initialize_schema(&self) -> Result<(), StorageError> {
        self.inner.initialize_schema()
    }
    fn check_schema_initialized(&self) -> Result<bool, StorageError> {
        self.inner.check_schema_initialized()
    }
    fn check_tables_populated(&self) -> Result<bool, StorageError> {
        self.inner.check_tables_populated()
    }
    fn drop_schema(&self) -> Result<(), StorageError> {
        self.inner.drop_schema()
    }
    fn records_generation(&self) -> Result<u64, StorageError> {
        self.inner.records_generation()
    }
    fn put_records(&self, source: SourceName, records: Vec<GeneRecord>) -> Result<(), StorageError> {
        self.inner.put_records(source, records)
    }
    fn put_source(&self, source: SourceName, records: Vec<GeneRecord>, meta: SourceMeta) -> Result<(), StorageError> {
        self.inner.put_source(source, records, meta)
    }
    fn put_merged(&self, concepts: Vec<MergedConcept>) -> Result<(), StorageError> {
        self.inner.put_merged(concepts)
    }
    fn put_merged_at(&self, generation: u64, concepts: Vec<MergedConcept>) -> Result<(), StorageError> {
        self.inner.put_merged_at(generation, concepts)
    }
    fn put_source_metadata(&self, source: SourceName, meta: SourceMeta) -> Result<(), StorageError> {
        self.inner.put_source_metadata(source, meta)
    }
    fn get_source_metadata(&self, source: SourceName) -> Result<Option<SourceMeta>, StorageError> {
        self.inner.get_source_metadata(source)
    }
    fn get_by_concept_id(&self, concept_id: &str) -> Result<Option<GeneRecord>, StorageError> {
        self.inner.get_by_concept_id(concept_id)
    }
    fn get_merged(&self, concept_id: &str) -> Result<Option<MergedConcept>, StorageError> {
        self.inner.get_merged(concept_id)
    }
    fn find_by_field(&self, field: LookupField, value: &str) -> Result<Vec<ConceptId>, StorageError> {
        self.inner.find_by_field(field, value)
    }
    fn scan_records(&self) -> Result<Vec<GeneRecord>, StorageError> {
        let records = self.inner.scan_records()?;
        if !self.reloaded.swap(true, Ordering::SeqCst) {
            load(&self.inner, SourceName::Ncbi, vec![draft("ncbigene:1", "A1BG", &[])]);
        }
        Ok(records)
    }
    fn scan_merged(&self) -> Result<Vec<MergedConcept>, StorageError> {
        self.inner.scan_merged()
    }
    fn all_concept_ids(&self) -> Result<Vec<ConceptId>, StorageError> {
        self.inner.all_concept_ids()
    }
    fn delete_source(&self, source: SourceName) -> Result<(), StorageError> {
        self.inner.delete_source(source)
    }
    fn delete_merged(&self) -> Result<(), StorageError> {
        self.inner.delete_merged()
    }
}

fn assert_reload_during_merge_is_refused<S: RecordStore>(inner: S) {
    load_fixture(&inner);
    let engine = MergeEngine::default();
    engine.run(&inner).unwrap();
    let before = inner.scan_merged().unwrap();

    let store = ReloadDuringScan {
        inner,
        reloaded: AtomicBool::new(false),
    };
    let err = engine.run(&store).unwrap_err();
    assert!(matches!(err, MergeError::RecordsChanged(_)), "{err}");
    assert_eq!(store.scan_merged().unwrap(), before);

    // retrying sees the reloaded NCBI records
    let report = engine.run(&store).unwrap();
    assert!(!store.get_merged("hgnc:1097").unwrap().unwrap().has_member("ncbigene:673"));
    assert_eq!(report.records, 5);
}

#[test]
fn test_reload_during_merge_is_refused_on_kv_store() {
    assert_reload_during_merge_is_refused(KvStore::open_in_memory());
}

#[test]
fn test_reload_during_merge_is_refused_on_sqlite_store() {
    assert_reload_during_merge_is_refused(SqliteStore::open_in_memory().unwrap());
}

#[test]
fn test_uninitialized_store_is_rejected() {
    let store = KvStore::connect_in_memory();
    let err = MergeEngine::default().run(&store).unwrap_err();
    assert_eq!(err, MergeError::SchemaUninitialized);
}

fn records() -> Vec<GeneRecord> {
    let build = |source, id: &str, symbol: &str, xrefs: &[&str]| {
        let mut builder = GeneRecord::builder(source, id, symbol);
        for x in xrefs {
            builder = builder.xref(x);
        }
        builder.build().unwrap()
    };
    vec![
        build(SourceName::Hgnc, "hgnc:1097", "BRAF", &["ncbigene:673"]),
        build(SourceName::Ensembl, "ensembl:ENSG00000157764", "BRAF", &["hgnc:1097"]),
        build(SourceName::Ncbi, "ncbigene:673", "BRAF", &[]),
        build(SourceName::Hgnc, "hgnc:5", "A1BG", &[]),
        build(SourceName::Ncbi, "ncbigene:1", "A1BG", &["hgnc:5"]),
        build(SourceName::Ensembl, "ensembl:ENSG00000121410", "A1BG", &["ncbigene:1"]),
        build(SourceName::Ncbi, "ncbigene:9", "NAT1", &["hgnc:7645"]),
        build(SourceName::Ensembl, "ensembl:ENSG00000171428", "NAT1", &[]),
    ]
}

proptest! {
    /// Groupings and canonical IDs never depend on input order.
    #[test]
    fn prop_plan_is_order_independent(shuffled in Just(records()).prop_shuffle()) {
        let engine = MergeEngine::default();
        let expected = engine.plan(records());
        let actual = engine.plan(shuffled);

        prop_assert_eq!(&actual.fingerprint(), &expected.fingerprint());
        prop_assert_eq!(&actual.concepts, &expected.concepts);
        prop_assert_eq!(&actual.dangling, &expected.dangling);
    }

    /// Records that share no xref path are never grouped.
    #[test]
    fn prop_unrelated_records_stay_apart(shuffled in Just(records()).prop_shuffle()) {
        let plan = MergeEngine::default().plan(shuffled);
        prop_assert_eq!(plan.concepts.len(), 4);
        for concept in &plan.concepts {
            let symbols: std::collections::BTreeSet<_> = records()
                .into_iter()
                .filter(|r| concept.has_member(r.concept_id.as_str()))
                .map(|r| r.symbol)
                .collect();
            prop_assert_eq!(symbols.len(), 1);
        }
    }
}

#[test]
fn test_singleton_keeps_own_id() {
    let plan = MergeEngine::default().plan(records());
    let nat1_ncbi = plan
        .concepts
        .iter()
        .find(|c| c.has_member("ncbigene:9"))
        .unwrap();
    assert_eq!(nat1_ncbi.concept_id.as_str(), "ncbigene:9");
    assert_eq!(nat1_ncbi.members.len(), 1);
    assert_eq!(plan.dangling.len(), 1);
}
