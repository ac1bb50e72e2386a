//! Query modes against loaded and merged stores.

use std::sync::Arc;

use genenorm::{
    load_source, ConceptId, GeneRecordDraft, MatchTier, NormalizerConfig, QueryHandler, QueryWarning, RecordStore,
    SearchOptions, SourceLoad, SourceMeta, SourceName, StoreConfig,
};

fn draft(id: &str, symbol: &str) -> GeneRecordDraft {
    GeneRecordDraft {
        concept_id: Some(id.to_string()),
        symbol: Some(symbol.to_string()),
        ..GeneRecordDraft::default()
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

fn load(store: &dyn RecordStore, source: SourceName, records: Vec<GeneRecordDraft>) {
    let meta = SourceMeta::new("custom", "https://example.org/license", "1").with_genome_assemblies(["GRCh38"]);
    load_source(store, source, SourceLoad { metadata: meta, records }).unwrap();
}

fn handler(store: StoreConfig) -> QueryHandler {
    let config = NormalizerConfig {
        store,
        ..NormalizerConfig::default()
    };
    let store = config.open_store().unwrap();

    let mut hgnc = draft("hgnc:1097", "BRAF");
    hgnc.previous_symbols = strings(&["BRAF1"]);
    hgnc.aliases = strings(&["NS7", "B-RAF1"]);
    hgnc.xrefs = strings(&["ensembl:ENSG00000157764", "ncbigene:673"]);
    hgnc.associated_with = strings(&["omim:164757"]);
    let mut hgnc_other = draft("hgnc:9999", "BRAFP1");
    hgnc_other.aliases = strings(&["B-RAF1"]);
    load(store.as_ref(), SourceName::Hgnc, vec![hgnc, hgnc_other]);

    let mut ensembl = draft("ensembl:ENSG00000157764", "BRAF");
    ensembl.xrefs = strings(&["hgnc:1097"]);
    load(store.as_ref(), SourceName::Ensembl, vec![ensembl]);

    let mut ncbi = draft("ncbigene:673", "BRAF");
    ncbi.aliases = strings(&["B-RAF1"]);
    ncbi.xrefs = strings(&["hgnc:1097"]);
    load(store.as_ref(), SourceName::Ncbi, vec![ncbi]);

    config.merge_engine().run(store.as_ref()).unwrap();
    config.query_handler(Arc::clone(&store))
}

fn handlers() -> Vec<QueryHandler> {
    vec![handler(StoreConfig::KvMemory), handler(StoreConfig::SqliteMemory)]
}

fn id(value: &str) -> ConceptId {
    ConceptId::parse(value).unwrap()
}

#[test]
fn test_normalize_tiers() {
    for q in handlers() {
        let cases = [
            ("hgnc:1097", MatchTier::ConceptId),
            ("HGNC:1097", MatchTier::ConceptId),
            ("ENSG00000157764", MatchTier::ConceptId),
            ("ncbigene:673", MatchTier::ConceptId),
            ("braf", MatchTier::Symbol),
            (" BRAF ", MatchTier::Symbol),
            ("braf1", MatchTier::PreviousSymbol),
            ("NS7", MatchTier::Alias),
            ("OMIM:164757", MatchTier::AssociatedWith),
        ];
        for (query, tier) in cases {
            let resp = q.normalize(query).unwrap();
            assert_eq!(resp.tier, tier, "{query}");
            assert_eq!(resp.concept_id(), Some(&id("hgnc:1097")), "{query}");
            assert!(resp.warnings.is_empty(), "{query}: {:?}", resp.warnings);
        }
    }
}

#[test]
fn test_normalize_attaches_source_metadata() {
    for q in handlers() {
        let resp = q.normalize("BRAF").unwrap();
        assert_eq!(
            resp.source_meta.keys().copied().collect::<Vec<_>>(),
            vec![SourceName::Hgnc, SourceName::Ensembl, SourceName::Ncbi]
        );
        assert_eq!(resp.source_meta[&SourceName::Ensembl].genome_assemblies, vec!["GRCh38"]);
        assert_eq!(resp.tier.score(), 100);
    }
}

#[test]
fn test_no_match_is_not_an_error() {
    for q in handlers() {
        for query in ["nonexistent-id", "", "   "] {
            let resp = q.normalize(query).unwrap();
            assert_eq!(resp.tier, MatchTier::NoMatch, "{query:?}");
            assert!(resp.concept.is_none());
            assert!(resp.source_meta.is_empty());
            assert_eq!(resp.tier.score(), 0);
        }
    }
}

#[test]
fn test_shared_alias_prefers_priority_and_warns() {
    for q in handlers() {
        let resp = q.normalize("b-raf1").unwrap();
        assert_eq!(resp.tier, MatchTier::Alias);
        assert_eq!(resp.concept_id(), Some(&id("hgnc:1097")));
        assert_eq!(
            resp.warnings,
            vec![QueryWarning::MultipleNormalizedConcepts {
                concept_ids: vec![id("hgnc:9999")],
            }]
        );
    }
}

#[test]
fn test_non_breaking_space_warning() {
    for q in handlers() {
        let resp = q.normalize("B\u{a0}RAF").unwrap();
        assert_eq!(resp.tier, MatchTier::NoMatch);
        assert!(matches!(
            resp.warnings.as_slice(),
            [QueryWarning::NonBreakingSpace { .. }]
        ));
    }
}

#[test]
fn test_normalize_unmerged_groups_members_by_source() {
    for q in handlers() {
        let resp = q.normalize_unmerged("NS7").unwrap();
        assert_eq!(resp.tier, MatchTier::Alias);
        assert_eq!(resp.normalized_concept_id, Some(id("hgnc:1097")));
        assert_eq!(resp.source_matches.len(), 3);

        let ncbi = &resp.source_matches[&SourceName::Ncbi];
        assert_eq!(ncbi.records.len(), 1);
        assert_eq!(ncbi.records[0].concept_id.as_str(), "ncbigene:673");
        assert!(ncbi.source_meta.is_some());

        let hgnc = &resp.source_matches[&SourceName::Hgnc];
        assert_eq!(hgnc.records.len(), 1);

        let none = q.normalize_unmerged("nonexistent-id").unwrap();
        assert_eq!(none.tier, MatchTier::NoMatch);
        assert!(none.normalized_concept_id.is_none());
        assert!(none.source_matches.is_empty());
    }
}

#[test]
fn test_search_reports_best_tier_per_record() {
    for q in handlers() {
        let resp = q.search("ncbigene:673", &SearchOptions::default()).unwrap();
        assert_eq!(resp.source_matches.len(), 3);

        let ncbi = &resp.source_matches[&SourceName::Ncbi];
        assert_eq!(ncbi.tier, MatchTier::ConceptId);
        assert_eq!(ncbi.records[0].record.concept_id.as_str(), "ncbigene:673");

        let hgnc = &resp.source_matches[&SourceName::Hgnc];
        assert_eq!(hgnc.tier, MatchTier::Xref);
        assert_eq!(hgnc.records.len(), 1);

        let ensembl = &resp.source_matches[&SourceName::Ensembl];
        assert_eq!(ensembl.tier, MatchTier::NoMatch);
        assert!(ensembl.records.is_empty());
        assert!(ensembl.source_meta.is_some());
    }
}

#[test]
fn test_search_orders_records_within_source() {
    for q in handlers() {
        let resp = q.search("B-RAF1", &SearchOptions::include("hgnc")).unwrap();
        assert_eq!(resp.source_matches.keys().copied().collect::<Vec<_>>(), vec![SourceName::Hgnc]);

        let hgnc = &resp.source_matches[&SourceName::Hgnc];
        assert_eq!(hgnc.tier, MatchTier::Alias);
        assert_eq!(
            hgnc.records
                .iter()
                .map(|m| m.record.concept_id.as_str())
                .collect::<Vec<_>>(),
            vec!["hgnc:1097", "hgnc:9999"]
        );
    }
}

#[test]
fn test_search_rejects_bad_options() {
    for q in handlers() {
        let both = SearchOptions {
            include: vec!["hgnc".to_string()],
            exclude: vec!["ncbi".to_string()],
        };
        assert!(q.search("BRAF", &both).is_err());
        assert!(q.search("BRAF", &SearchOptions::exclude("hgnc,foo")).is_err());

        let resp = q.search("BRAF", &SearchOptions::exclude("hgnc")).unwrap();
        assert!(!resp.source_matches.contains_key(&SourceName::Hgnc));
        assert_eq!(resp.source_matches[&SourceName::Ncbi].tier, MatchTier::Symbol);
    }
}

#[test]
fn test_response_serializes_tier_names() {
    let q = handler(StoreConfig::KvMemory);
    let resp = q.normalize("NS7").unwrap();
    let json = serde_json::to_value(&resp).unwrap();
    assert_eq!(json["tier"], "alias");
    assert_eq!(json["concept"]["concept_id"], "hgnc:1097");
}
