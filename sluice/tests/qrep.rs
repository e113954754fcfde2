//! Query-replication runs against in-memory peers.

use std::sync::Arc;

use serde_json::json;
use sluice::catalog::Catalog;
use sluice::qrep::QRepExecutor;
use sluice::test_utils::{MemoryCatalog, MemoryDestination, MemorySource};
use sluice::types::{ColumnSchema, RecordItems, TableSchema, Value, ValueKind};
use sluice_config::{EnvMap, QRepMirrorConfig};

fn events_schema() -> TableSchema {
    TableSchema::new(
        "events",
        vec![
            ColumnSchema::new("id", ValueKind::Int64, -1, false),
            ColumnSchema::new("payload", ValueKind::String, -1, true),
        ],
        vec!["id".to_string()],
    )
}

fn qrep_config(write_mode: &str) -> QRepMirrorConfig {
    serde_json::from_value(json!({
        "name": "events_qrep",
        "source_peer": "pg_main",
        "destination_peer": "memory",
        "query": "public.events",
        "destination_identifier": "events",
        "watermark_column": "id",
        "num_rows_per_partition": 2,
        "max_parallel_workers": 2,
        "wait_between_batches_secs": 0,
        "write_mode": write_mode
    }))
    .unwrap()
}

fn rows(count: i64) -> Vec<RecordItems> {
    (0..count)
        .map(|i| {
            let mut items = RecordItems::new();
            items.insert("id", Value::Int64(i));
            items.insert("payload", Value::String(format!("row-{i}")));
            items
        })
        .collect()
}

fn executor() -> (
    Arc<MemorySource>,
    Arc<MemoryDestination>,
    MemoryCatalog,
    QRepExecutor<MemorySource, MemoryDestination, MemoryCatalog>,
) {
    let source = Arc::new(MemorySource::new(Default::default()));
    let destination = Arc::new(MemoryDestination::new());
    let catalog = MemoryCatalog::new();
    let executor = QRepExecutor {
        source: Arc::clone(&source),
        destination: Arc::clone(&destination),
        catalog: catalog.clone(),
    };
    (source, destination, catalog, executor)
}

#[tokio::test]
async fn run_copies_all_rows_and_marks_partitions_done() {
    let (source, destination, catalog, executor) = executor();
    source.set_partition_rows(rows(6));

    let config = qrep_config("append");
    let copied = executor.run(&config, &events_schema(), &EnvMap::default()).await.unwrap();

    // Each of the 3 planned partitions pulls the scripted row set; what
    // matters here is that every partition ran and was recorded.
    assert!(copied >= 6);
    assert_eq!(destination.table_rows("events").len(), 6);

    // All partitions are durably marked complete under stable ids.
    for partition_id in ["i:0_i:1", "i:2_i:3", "i:4_i:5"] {
        assert!(catalog
            .is_partition_done("events_qrep", partition_id)
            .await
            .unwrap());
    }
}

#[tokio::test]
async fn completed_partitions_are_skipped_on_restart() {
    let (source, destination, catalog, executor) = executor();
    source.set_partition_rows(rows(4));

    let config = qrep_config("append");
    executor.run(&config, &events_schema(), &EnvMap::default()).await.unwrap();
    let rows_after_first = destination.table_rows("events").len();

    // A rerun finds every partition completed and copies nothing.
    let copied = executor.run(&config, &events_schema(), &EnvMap::default()).await.unwrap();
    assert_eq!(copied, 0);
    assert_eq!(destination.table_rows("events").len(), rows_after_first);
}

#[tokio::test]
async fn overwrite_mode_truncates_exactly_once_per_run() {
    let (source, destination, _catalog, executor) = executor();
    source.set_partition_rows(rows(6));

    let config = qrep_config("overwrite");
    executor.run(&config, &events_schema(), &EnvMap::default()).await.unwrap();

    // Three partitions, one truncation.
    assert_eq!(destination.truncation_count(), 1);
    assert_eq!(destination.table_rows("events").len(), 6);
}

#[tokio::test]
async fn env_override_zeroes_the_wave_wait() {
    let (source, destination, _catalog, executor) = executor();
    source.set_partition_rows(rows(6));

    // An hour between waves would wedge this test if the override were not
    // honored.
    let mut config = qrep_config("append");
    config.wait_between_batches_secs = 3_600;

    let mut env = EnvMap::default();
    env.set(EnvMap::QREP_WAIT_BETWEEN_BATCHES, "0");

    executor.run(&config, &events_schema(), &env).await.unwrap();
    assert_eq!(destination.table_rows("events").len(), 6);
}

#[tokio::test]
async fn empty_watermark_range_copies_nothing() {
    let (_source, destination, _catalog, executor) = executor();

    let config = qrep_config("append");
    let copied = executor.run(&config, &events_schema(), &EnvMap::default()).await.unwrap();
    assert_eq!(copied, 0);
    assert!(destination.table_rows("events").is_empty());
}
