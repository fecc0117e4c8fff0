//! End-to-end ingestion against the in-memory store

use rfid_sync::domain::types::{EntityKind, SyncResult};
use rfid_sync::infra::{Config, Metrics};
use rfid_sync::io::store::{InventoryStore, MemoryStore};
use rfid_sync::services::{
    run_ingestion, DedupCache, Disposition, Pipeline, Reconciler, RetryPolicy,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::watch;

const CONFIG: &str = r#"
[readers.R1]
location = "Dock1"
duplicate_window_secs = 30

[readers.R2]
location = "Aisle4"
duplicate_window_secs = 30

[[products]]
epc_prefix = "AAAA"
name = "Widget"

[[products]]
epc_prefix = "BBBB"
name = "Gadget"

[store]
backend = "memory"
"#;

fn load_config() -> Config {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    file.flush().unwrap();
    Config::from_file(file.path()).unwrap()
}

fn seeded_store() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new()
            .with_product("Widget")
            .with_product("Gadget")
            .with_location("Dock1")
            .with_location("Aisle4"),
    )
}

fn build_pipeline(config: &Config, store: Arc<MemoryStore>, metrics: Arc<Metrics>) -> Pipeline {
    let retry = RetryPolicy::no_retry(Duration::from_secs(1));
    let reconciler = Reconciler::new(store, retry).with_metrics(metrics.clone());
    Pipeline::from_config(config, Arc::new(DedupCache::new()), metrics).with_reconciler(reconciler)
}

#[tokio::test]
async fn test_stream_reconciles_each_new_tag_once() {
    let config = load_config();
    let store = seeded_store();
    let metrics = Arc::new(Metrics::new());
    let pipeline = Arc::new(build_pipeline(&config, store.clone(), metrics.clone()));

    let input: &[u8] = b"R1,AAAAAAAAAAAAAAAAAAAAAAAA,ant1\r\n\
R1,AAAAAAAAAAAAAAAAAAAAAAAA,ant1\r\n\
R1,AAAA00000000000000000001,ant2\r\n\
R2,AAAAAAAAAAAAAAAAAAAAAAAA,ant1\r\n\
R7,AAAAAAAAAAAAAAAAAAAAAAAA,ant1\r\n\
R1,00000000000000000000000001,ant1\r\n\
R1,CCCCCCCCCCCCCCCCCCCCCCCC,ant1\r\n\
garbage\r\n";

    let (_tx, rx) = watch::channel(false);
    run_ingestion("replay", input, pipeline, Duration::from_millis(100), rx).await.unwrap();

    let widget = store.find_by_name(EntityKind::Product, "Widget").await.unwrap().unwrap();
    let dock = store.find_by_name(EntityKind::Location, "Dock1").await.unwrap().unwrap();
    let aisle = store.find_by_name(EntityKind::Location, "Aisle4").await.unwrap().unwrap();

    // Two distinct EPCs first seen at Dock1; the Aisle4 read only moves the tag
    assert_eq!(store.inventory_level(widget, dock), Some(2.0));
    assert_eq!(store.inventory_level(widget, aisle), None);
    assert_eq!(store.tag_count(), 2);
    let tag = &store.tags_for_epc("AAAAAAAAAAAAAAAAAAAAAAAA")[0];
    assert_eq!(tag.last_scan_location, Some(aisle));

    let summary = metrics.report();
    assert_eq!(summary.frames_total, 8);
    assert_eq!(summary.frames_duplicate, 1);
    assert_eq!(summary.frames_unknown_reader, 1);
    assert_eq!(summary.frames_invalid_epc, 1);
    assert_eq!(summary.frames_unmapped, 1);
    assert_eq!(summary.frames_malformed, 1);
    assert_eq!(summary.tags_created, 2);
    assert_eq!(summary.tags_updated, 1);
}

#[tokio::test]
async fn test_conflicting_product_claim_leaves_tag_untouched() {
    let config = load_config();
    let store = seeded_store();
    let metrics = Arc::new(Metrics::new());
    let pipeline = build_pipeline(&config, store.clone(), metrics.clone());

    // Bind the EPC to Gadget out of band, then let the Widget prefix claim it
    let gadget = store.add_named(EntityKind::Product, "Gadget");
    let reconciler =
        Reconciler::new(store.clone(), RetryPolicy::no_retry(Duration::from_secs(1)));
    let created =
        reconciler.reconcile("AAAAAAAAAAAAAAAAAAAAAAAA", "Dock1", "Gadget").await.unwrap();
    assert!(matches!(created, SyncResult::Created { .. }));

    let d = pipeline.process_line(b"R1,AAAAAAAAAAAAAAAAAAAAAAAA,ant1\n").await;
    assert_eq!(d.as_str(), "failed");
    assert!(matches!(
        d,
        Disposition::Failed(rfid_sync::domain::ReconcileError::ProductConflict { .. })
    ));

    let tags = store.tags_for_epc("AAAAAAAAAAAAAAAAAAAAAAAA");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].product_id, gadget);
    assert_eq!(metrics.conflicts(), 1);
}

#[tokio::test]
async fn test_accept_only_pipeline_without_store() {
    let config = load_config();
    let metrics = Arc::new(Metrics::new());
    let pipeline = Pipeline::from_config(&config, Arc::new(DedupCache::new()), metrics.clone());

    let d = pipeline.process_line(b"R1,BBBBBBBBBBBBBBBBBBBBBBBB,ant1\n").await;
    assert!(matches!(d, Disposition::Accepted));
    let d = pipeline.process_line(b"R1,BBBBBBBBBBBBBBBBBBBBBBBB,ant1\n").await;
    assert!(matches!(d, Disposition::Duplicate));
    assert_eq!(metrics.report().sightings_accepted, 1);
}
