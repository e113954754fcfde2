//! End-to-end pipeline behavior against in-memory peers.
//!
//! These tests drive the real activities (pull into the change buffer, raw
//! append, merge) and assert on the normalized state the way an operator
//! would see it on a warehouse.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sluice::catalog::Catalog;
use sluice::classifier::{self, ErrorAction, ErrorSource, PeerError};
use sluice::destination::CdcSync;
use sluice::error::ErrorKind;
use sluice::sluice_error;
use sluice::test_utils::{MemoryCatalog, MemoryDestination, MemorySource};
use sluice::types::{
    AddedColumn, ChangeMeta, ChangeRecord, Checkpoint, ColumnSchema, RecordItems, SchemaDelta,
    TableSchema, Value, ValueKind,
};
use sluice::workflow::MirrorActivities;
use sluice_config::{BatchConfig, MirrorConfig, SnapshotConfig};

const MIRROR: &str = "orders_mirror";
const SRC_TABLE: &str = "public.orders";
const DST_TABLE: &str = "orders";

fn orders_schema() -> TableSchema {
    TableSchema::new(
        DST_TABLE,
        vec![
            ColumnSchema::new("id", ValueKind::Int64, -1, false),
            ColumnSchema::new("total", ValueKind::Int64, -1, true),
            ColumnSchema::new("description", ValueKind::String, -1, true),
        ],
        vec!["id".to_string()],
    )
}

fn mirror_config(soft_delete: bool) -> MirrorConfig {
    let raw = json!({
        "name": MIRROR,
        "source_peer": "pg_main",
        "destination_peer": "memory",
        "table_mappings": [{
            "source_identifier": SRC_TABLE,
            "destination_identifier": DST_TABLE
        }],
        "do_initial_snapshot": false,
        "soft_delete_col_name": soft_delete.then_some("_peerdb_is_deleted"),
        "synced_at_col_name": "_peerdb_synced_at"
    });
    let mut config: MirrorConfig = serde_json::from_value(raw).unwrap();
    config.batch = BatchConfig {
        max_batch_size: 1000,
        idle_timeout_secs: 1,
    };
    config.snapshot = SnapshotConfig::default();
    config
}

struct Harness {
    source: Arc<MemorySource>,
    destination: Arc<MemoryDestination>,
    catalog: MemoryCatalog,
    activities: MirrorActivities<MemorySource, MemoryDestination, MemoryCatalog>,
    table_schemas: HashMap<String, TableSchema>,
}

fn harness(soft_delete: bool) -> Harness {
    let mut schemas = HashMap::new();
    schemas.insert(SRC_TABLE.to_string(), orders_schema());

    let source = Arc::new(MemorySource::new(schemas));
    let destination = Arc::new(MemoryDestination::new());
    let catalog = MemoryCatalog::new();

    let activities = MirrorActivities {
        source: Arc::clone(&source),
        destination: Arc::clone(&destination),
        catalog: catalog.clone(),
        config: mirror_config(soft_delete),
    };

    let mut table_schemas = HashMap::new();
    table_schemas.insert(DST_TABLE.to_string(), orders_schema());

    Harness {
        source,
        destination,
        catalog,
        activities,
        table_schemas,
    }
}

fn commit_time(offset: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(1_700_000_000_000_000 + offset as i64).unwrap()
}

fn meta(offset: u64) -> ChangeMeta {
    ChangeMeta {
        checkpoint: Checkpoint::new(offset),
        commit_time: commit_time(offset),
        source_table: SRC_TABLE.to_string(),
        destination_table: DST_TABLE.to_string(),
    }
}

fn items(id: i64, total: i64, description: &str) -> RecordItems {
    let mut items = RecordItems::new();
    items.insert("id", Value::Int64(id));
    items.insert("total", Value::Int64(total));
    items.insert("description", Value::String(description.to_string()));
    items
}

fn insert(offset: u64, id: i64, total: i64, description: &str) -> ChangeRecord {
    ChangeRecord::Insert {
        meta: meta(offset),
        items: items(id, total, description),
    }
}

fn update(offset: u64, id: i64, total: i64, description: &str) -> ChangeRecord {
    ChangeRecord::Update {
        meta: meta(offset),
        items: items(id, total, description),
        old_items: None,
        unchanged_toast_columns: BTreeSet::new(),
    }
}

fn update_with_toast(offset: u64, id: i64, total: i64, toast: &[&str]) -> ChangeRecord {
    let mut items = RecordItems::new();
    items.insert("id", Value::Int64(id));
    items.insert("total", Value::Int64(total));

    ChangeRecord::Update {
        meta: meta(offset),
        items,
        old_items: None,
        unchanged_toast_columns: toast.iter().map(|s| s.to_string()).collect(),
    }
}

// Deletes carry the full pre-image, as a replica-identity-full source
// publishes them.
fn delete(offset: u64, id: i64, total: i64, description: &str) -> ChangeRecord {
    ChangeRecord::Delete {
        meta: meta(offset),
        old_items: items(id, total, description),
    }
}

#[tokio::test]
async fn insert_update_delete_one_key_hard_delete() {
    let mut h = harness(false);

    h.source.push_record(insert(10, 1, 5, "a"));
    h.source.push_record(update(11, 1, 6, "b"));
    h.source.push_record(delete(12, 1, 6, "b"));

    let outcome = h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    let batch_id = outcome.batch_id.expect("a batch must land");

    // One raw row per event.
    let raw = h.destination.raw_batch(batch_id);
    assert_eq!(raw.len(), 3);
    assert_eq!(
        raw.iter().map(|r| r.record_type).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    h.activities.normalize_step(&h.table_schemas).await.unwrap();

    // Hard delete: the row is gone.
    assert!(h.destination.row(DST_TABLE, &json!(1)).is_none());
}

#[tokio::test]
async fn insert_update_delete_one_key_soft_delete() {
    let mut h = harness(true);

    h.source.push_record(insert(10, 1, 5, "a"));
    h.source.push_record(update(11, 1, 6, "b"));
    h.source.push_record(delete(12, 1, 6, "b"));

    h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    h.activities.normalize_step(&h.table_schemas).await.unwrap();

    let row = h
        .destination
        .row(DST_TABLE, &json!(1))
        .expect("soft delete keeps the row");
    assert_eq!(row.get("_peerdb_is_deleted"), Some(&json!(true)));
    // Destination columns reflect the update's values.
    assert_eq!(row.get("total"), Some(&json!(6)));
    assert_eq!(row.get("description"), Some(&json!("b")));
}

#[tokio::test]
async fn updates_across_two_batches_converge_to_the_latest() {
    let mut h = harness(false);

    h.source.push_record(insert(10, 1, 5, "first"));
    h.activities.sync_step(&mut h.table_schemas).await.unwrap();

    h.source.push_record(update(20, 1, 9, "second"));
    h.activities.sync_step(&mut h.table_schemas).await.unwrap();

    let cursor = h.catalog.get_cursor(MIRROR).await.unwrap();
    assert_eq!(cursor.last_sync_batch_id, 2);
    assert_eq!(cursor.last_normalize_batch_id, 0);

    // One normalize run covers both pending batches in order.
    h.activities.normalize_step(&h.table_schemas).await.unwrap();

    let cursor = h.catalog.get_cursor(MIRROR).await.unwrap();
    assert_eq!(cursor.last_normalize_batch_id, 2);

    let row = h.destination.row(DST_TABLE, &json!(1)).unwrap();
    assert_eq!(row.get("total"), Some(&json!(9)));
    assert_eq!(row.get("description"), Some(&json!("second")));
}

#[tokio::test]
async fn unchanged_toast_columns_are_preserved() {
    let mut h = harness(false);

    h.source
        .push_record(insert(10, 1, 5, "original description"));
    h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    h.activities.normalize_step(&h.table_schemas).await.unwrap();

    // The update omits `description`, marking it unchanged TOAST.
    h.source
        .push_record(update_with_toast(20, 1, 42, &["description"]));
    h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    h.activities.normalize_step(&h.table_schemas).await.unwrap();

    let row = h.destination.row(DST_TABLE, &json!(1)).unwrap();
    // The preserved column still holds its pre-batch value.
    assert_eq!(
        row.get("description"),
        Some(&json!("original description"))
    );
    // Other columns carry the new values.
    assert_eq!(row.get("total"), Some(&json!(42)));
}

#[tokio::test]
async fn mid_stream_column_add_is_replayed_before_normalize() {
    let mut h = harness(false);

    h.source.push_record(insert(10, 1, 5, "before delta"));
    h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    h.activities.normalize_step(&h.table_schemas).await.unwrap();

    // The source adds column `c` and publishes rows carrying c = 42.
    h.source.push_delta(SchemaDelta {
        source_table: SRC_TABLE.to_string(),
        destination_table: DST_TABLE.to_string(),
        added_columns: vec![AddedColumn {
            name: "c".to_string(),
            kind: ValueKind::Int32,
            nullable: true,
        }],
        nullable_enabled: false,
    });
    for i in 0..10 {
        let mut record_items = items(100 + i, 1, "after delta");
        record_items.insert("c", Value::Int32(42));
        h.source.push_record(ChangeRecord::Insert {
            meta: meta(20 + i as u64),
            items: record_items,
        });
    }

    h.activities.sync_step(&mut h.table_schemas).await.unwrap();

    // The destination saw ADD COLUMN before the batch normalized, and the
    // tracked schema now carries the column.
    assert_eq!(h.destination.added_columns(DST_TABLE), vec!["c"]);
    assert!(h.table_schemas[DST_TABLE].column("c").is_some());

    h.activities.normalize_step(&h.table_schemas).await.unwrap();

    for i in 0..10 {
        let row = h.destination.row(DST_TABLE, &json!(100 + i)).unwrap();
        assert_eq!(row.get("c"), Some(&json!(42)));
    }
    // Rows from before the delta have no value for the new column.
    let old_row = h.destination.row(DST_TABLE, &json!(1)).unwrap();
    assert_eq!(old_row.get("c"), None);
}

#[tokio::test]
async fn dropped_publication_classifies_as_user_notification() {
    let mut h = harness(false);

    h.source.push_record(insert(10, 1, 5, "a"));
    h.source.push_error(
        sluice_error!(ErrorKind::ReplicationStreamFailed, "Pull failed").with_source(
            PeerError::new(
                ErrorSource::Postgres,
                "42704",
                r#"publication "sluice_pub_orders_mirror" does not exist"#,
            ),
        ),
    );

    let err = h
        .activities
        .sync_step(&mut h.table_schemas)
        .await
        .expect_err("the pull must surface the error");

    let (class, info) = classifier::classify(&err);
    assert_eq!(class.name, "NOTIFY_PUBLICATION_MISSING");
    assert_eq!(class.action, ErrorAction::NotifyUser);
    assert_eq!(info.code, "42704");

    // Nothing was committed: the cursor never moved.
    let cursor = h.catalog.get_cursor(MIRROR).await.unwrap();
    assert_eq!(cursor.last_sync_batch_id, 0);
}

#[tokio::test]
async fn replayed_sync_batch_leaves_raw_table_and_cursors_unchanged() {
    let mut h = harness(false);

    h.source.push_record(insert(10, 1, 5, "a"));
    h.source.push_record(insert(11, 2, 6, "b"));
    let outcome = h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    let batch_id = outcome.batch_id.unwrap();

    let raw_before = h.destination.raw_batch(batch_id);
    let cursor_before = h.catalog.get_cursor(MIRROR).await.unwrap();

    // Re-landing the same batch id, as a workflow retry would.
    h.destination
        .sync_batch(MIRROR, batch_id, raw_before.clone())
        .await
        .unwrap();
    h.catalog
        .finish_sync_batch(MIRROR, batch_id, &cursor_before.last_offset)
        .await
        .unwrap();

    assert_eq!(h.destination.raw_batch(batch_id), raw_before);
    assert_eq!(h.catalog.get_cursor(MIRROR).await.unwrap(), cursor_before);
}

#[tokio::test]
async fn replayed_normalize_batch_is_a_no_op() {
    let mut h = harness(true);

    h.source.push_record(insert(10, 1, 5, "a"));
    h.source.push_record(update(11, 1, 6, "b"));
    h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    h.activities.normalize_step(&h.table_schemas).await.unwrap();

    let rows_before = h.destination.table_rows(DST_TABLE);

    // A second normalize over the same cursor range does nothing.
    h.activities.normalize_step(&h.table_schemas).await.unwrap();
    assert_eq!(h.destination.table_rows(DST_TABLE), rows_before);
}

#[tokio::test]
async fn batch_boundary_flushes_at_exactly_max_batch_size() {
    let mut h = harness(false);
    h.activities.config.batch.max_batch_size = 5;

    for i in 0..7 {
        h.source.push_record(insert(10 + i as u64, i, 0, "x"));
    }

    // First step accepts exactly max_batch_size records.
    let first = h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    assert_eq!(first.records_synced, 5);

    // The remaining two begin the next batch.
    let second = h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    assert_eq!(second.records_synced, 2);
    assert_eq!(second.batch_id, Some(2));
}

#[tokio::test]
async fn idle_source_produces_no_batch() {
    let mut h = harness(false);

    let outcome = h.activities.sync_step(&mut h.table_schemas).await.unwrap();
    assert_eq!(outcome.batch_id, None);
    assert_eq!(h.destination.raw_row_count(), 0);

    let cursor = h.catalog.get_cursor(MIRROR).await.unwrap();
    assert_eq!(cursor.last_sync_batch_id, 0);
}

#[tokio::test]
async fn normalize_cursor_never_passes_sync_cursor() {
    let h = harness(false);

    h.catalog
        .finish_sync_batch(MIRROR, 1, &Checkpoint::new(10))
        .await
        .unwrap();

    let err = h
        .catalog
        .finish_normalize_batch(MIRROR, 2)
        .await
        .expect_err("normalize past sync must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    h.catalog.finish_normalize_batch(MIRROR, 1).await.unwrap();
    // Replay of an applied batch is a quiet no-op.
    h.catalog.finish_normalize_batch(MIRROR, 1).await.unwrap();

    let cursor = h.catalog.get_cursor(MIRROR).await.unwrap();
    assert_eq!(cursor.last_normalize_batch_id, 1);
}
