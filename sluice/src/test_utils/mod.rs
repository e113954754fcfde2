//! In-memory peers and catalog for integration tests.
//!
//! [`MemoryDestination`] executes the raw-append and merge semantics in
//! process: batches land atomically and idempotently, and normalize applies
//! the same dedup, soft-delete and unchanged-TOAST rules the SQL merges
//! implement, so pipeline behavior is observable without a warehouse.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferKey, ChangeBuffer};
use crate::catalog::{Catalog, MirrorStatus};
use crate::destination::{
    CdcNormalize, CdcSync, NormalizeOutcome, NormalizeRequest, QRepSync, RenameTables,
    ValidateDestination,
};
use crate::error::{ErrorKind, SluiceResult};
use crate::qrep::{Partition, PartitionValue};
use crate::source::{
    CdcPull, GetTableSchema, GetVersion, PullOutcome, PullRequest, QRepPull, ReplicationSetup,
    ValidateSource, WatermarkStats,
};
use crate::types::{
    BatchCursor, ChangeRecord, Checkpoint, RawRow, RecordItems, SchemaDelta, TableSchema,
};
use crate::{bail, sluice_error};

// ── Memory catalog ───────────────────────────────────────────────────────────

#[derive(Default)]
struct CatalogInner {
    cursors: HashMap<String, BatchCursor>,
    statuses: HashMap<String, MirrorStatus>,
    errors: HashMap<String, (String, String)>,
    partitions: HashMap<(String, String), bool>,
    schemas: HashMap<(String, String), TableSchema>,
}

/// In-memory catalog with the same cursor guarantees as the Postgres one.
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    inner: Arc<Mutex<CatalogInner>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the persisted error for a mirror, if any.
    pub fn mirror_error(&self, mirror: &str) -> Option<(String, String)> {
        self.inner.lock().errors.get(mirror).cloned()
    }
}

impl Catalog for MemoryCatalog {
    async fn get_cursor(&self, mirror: &str) -> SluiceResult<BatchCursor> {
        let mut inner = self.inner.lock();
        Ok(inner.cursors.entry(mirror.to_string()).or_default().clone())
    }

    async fn set_last_offset(&self, mirror: &str, offset: &Checkpoint) -> SluiceResult<()> {
        let mut inner = self.inner.lock();
        let cursor = inner.cursors.entry(mirror.to_string()).or_default();
        if offset.id >= cursor.last_offset.id {
            cursor.last_offset = offset.clone();
        }
        Ok(())
    }

    async fn finish_sync_batch(
        &self,
        mirror: &str,
        batch_id: i64,
        offset: &Checkpoint,
    ) -> SluiceResult<()> {
        let mut inner = self.inner.lock();
        let cursor = inner.cursors.entry(mirror.to_string()).or_default();
        if batch_id > cursor.last_sync_batch_id {
            cursor.last_sync_batch_id = batch_id;
            if offset.id >= cursor.last_offset.id {
                cursor.last_offset = offset.clone();
            }
        }
        Ok(())
    }

    async fn finish_normalize_batch(&self, mirror: &str, batch_id: i64) -> SluiceResult<()> {
        let mut inner = self.inner.lock();
        let cursor = inner.cursors.entry(mirror.to_string()).or_default();
        if batch_id > cursor.last_sync_batch_id {
            bail!(
                ErrorKind::InvalidState,
                "Normalize cursor cannot pass the sync cursor",
                format!(
                    "normalize batch {batch_id} > last sync batch {}",
                    cursor.last_sync_batch_id
                )
            );
        }
        if batch_id > cursor.last_normalize_batch_id {
            cursor.last_normalize_batch_id = batch_id;
        }
        Ok(())
    }

    async fn set_mirror_status(&self, mirror: &str, status: MirrorStatus) -> SluiceResult<()> {
        self.inner.lock().statuses.insert(mirror.to_string(), status);
        Ok(())
    }

    async fn get_mirror_status(&self, mirror: &str) -> SluiceResult<Option<MirrorStatus>> {
        Ok(self.inner.lock().statuses.get(mirror).copied())
    }

    async fn set_mirror_error(
        &self,
        mirror: &str,
        error_class: &str,
        error_message: &str,
    ) -> SluiceResult<()> {
        self.inner.lock().errors.insert(
            mirror.to_string(),
            (error_class.to_string(), error_message.to_string()),
        );
        Ok(())
    }

    async fn drop_mirror(&self, mirror: &str) -> SluiceResult<()> {
        let mut inner = self.inner.lock();
        inner.cursors.remove(mirror);
        inner.statuses.remove(mirror);
        inner.errors.remove(mirror);
        inner.partitions.retain(|(m, _), _| m != mirror);
        inner.schemas.retain(|(m, _), _| m != mirror);
        Ok(())
    }

    async fn register_partition(
        &self,
        mirror: &str,
        partition_id: &str,
        _range_start: &str,
        _range_end: &str,
    ) -> SluiceResult<()> {
        self.inner
            .lock()
            .partitions
            .entry((mirror.to_string(), partition_id.to_string()))
            .or_insert(false);
        Ok(())
    }

    async fn is_partition_done(&self, mirror: &str, partition_id: &str) -> SluiceResult<bool> {
        Ok(self
            .inner
            .lock()
            .partitions
            .get(&(mirror.to_string(), partition_id.to_string()))
            .copied()
            .unwrap_or(false))
    }

    async fn mark_partition_done(&self, mirror: &str, partition_id: &str) -> SluiceResult<()> {
        self.inner
            .lock()
            .partitions
            .insert((mirror.to_string(), partition_id.to_string()), true);
        Ok(())
    }

    async fn store_table_schema(
        &self,
        mirror: &str,
        source_table: &str,
        schema: &TableSchema,
    ) -> SluiceResult<()> {
        self.inner
            .lock()
            .schemas
            .insert((mirror.to_string(), source_table.to_string()), schema.clone());
        Ok(())
    }

    async fn load_table_schema(
        &self,
        mirror: &str,
        source_table: &str,
    ) -> SluiceResult<Option<TableSchema>> {
        Ok(self
            .inner
            .lock()
            .schemas
            .get(&(mirror.to_string(), source_table.to_string()))
            .cloned())
    }
}

// ── Memory source ────────────────────────────────────────────────────────────

/// One scripted item fed through [`MemorySource::pull`].
pub enum ScriptedItem {
    Record(ChangeRecord),
    Delta(SchemaDelta),
    /// The pull fails with this error once the item is reached.
    Error(crate::error::SluiceError),
}

struct SourceInner {
    items: VecDeque<ScriptedItem>,
    schemas: HashMap<String, TableSchema>,
    partition_rows: Vec<RecordItems>,
}

/// Scripted in-memory source peer.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<SourceInner>>,
}

impl MemorySource {
    /// Creates a source serving `schemas`, keyed by source identifier.
    pub fn new(schemas: HashMap<String, TableSchema>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SourceInner {
                items: VecDeque::new(),
                schemas,
                partition_rows: Vec::new(),
            })),
        }
    }

    pub fn push_record(&self, record: ChangeRecord) {
        self.inner.lock().items.push_back(ScriptedItem::Record(record));
    }

    pub fn push_delta(&self, delta: SchemaDelta) {
        self.inner.lock().items.push_back(ScriptedItem::Delta(delta));
    }

    pub fn push_error(&self, error: crate::error::SluiceError) {
        self.inner.lock().items.push_back(ScriptedItem::Error(error));
    }

    pub fn set_partition_rows(&self, rows: Vec<RecordItems>) {
        self.inner.lock().partition_rows = rows;
    }

    fn schema_for_destination(&self, destination_table: &str) -> Option<TableSchema> {
        let inner = self.inner.lock();
        inner
            .schemas
            .values()
            .find(|schema| schema.name == destination_table)
            .cloned()
    }
}

impl CdcPull for MemorySource {
    async fn setup_replication(
        &self,
        _start_offset: &Checkpoint,
    ) -> SluiceResult<ReplicationSetup> {
        Ok(ReplicationSetup {
            slot_name: "memory_slot".to_string(),
            snapshot_name: None,
            supports_tid_scans: false,
            initial_offset: Checkpoint::new(1),
        })
    }

    async fn pull(&self, request: PullRequest, buffer: &mut ChangeBuffer) -> SluiceResult<PullOutcome> {
        let mut outcome = PullOutcome::default();

        // An empty queue plays the role of the idle timeout firing.
        while outcome.records < request.batch_limit {
            let item = {
                let mut inner = self.inner.lock();
                inner.items.pop_front()
            };
            let Some(item) = item else { break };

            match item {
                ScriptedItem::Record(record) => {
                    let checkpoint = record.meta().checkpoint.clone();
                    let key = match (
                        self.schema_for_destination(&record.meta().destination_table),
                        record.items(),
                    ) {
                        (Some(schema), Some(items)) => BufferKey::from_items(&schema, items),
                        _ => BufferKey::unkeyed(&record.meta().destination_table),
                    };
                    buffer.set(key, record)?;
                    outcome.records += 1;
                    outcome.offset_reached = checkpoint;
                }
                ScriptedItem::Delta(delta) => {
                    outcome.schema_deltas.push(delta);
                }
                ScriptedItem::Error(error) => return Err(error),
            }
        }

        Ok(outcome)
    }

    async fn keepalive(&self) -> SluiceResult<()> {
        Ok(())
    }

    async fn ack(&self, _offset: &Checkpoint) -> SluiceResult<()> {
        Ok(())
    }

    async fn cleanup(&self, _mirror_name: &str) -> SluiceResult<()> {
        Ok(())
    }
}

impl GetTableSchema for MemorySource {
    async fn table_schema(
        &self,
        source_identifier: &str,
        _destination_identifier: &str,
        _excluded_columns: &[String],
    ) -> SluiceResult<TableSchema> {
        self.inner
            .lock()
            .schemas
            .get(source_identifier)
            .cloned()
            .ok_or_else(|| {
                sluice_error!(
                    ErrorKind::ValidationError,
                    "Source table not found",
                    source_identifier.to_string()
                )
            })
    }
}

impl QRepPull for MemorySource {
    async fn watermark_stats(
        &self,
        _table: &str,
        _watermark_column: &str,
        _last_end: Option<&PartitionValue>,
    ) -> SluiceResult<Option<WatermarkStats>> {
        let inner = self.inner.lock();
        if inner.partition_rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(WatermarkStats {
            min: PartitionValue::Int(0),
            max: PartitionValue::Int(inner.partition_rows.len() as i64 - 1),
            row_count: inner.partition_rows.len() as u64,
        }))
    }

    async fn pull_partition(
        &self,
        _table: &str,
        _watermark_column: &str,
        _partition: &Partition,
    ) -> SluiceResult<Vec<RecordItems>> {
        Ok(self.inner.lock().partition_rows.clone())
    }
}

impl ValidateSource for MemorySource {
    async fn validate_mirror_source(&self, _table_identifiers: &[String]) -> SluiceResult<()> {
        Ok(())
    }
}

impl GetVersion for MemorySource {
    async fn version(&self) -> SluiceResult<String> {
        Ok("memory".to_string())
    }
}

// ── Memory destination ───────────────────────────────────────────────────────

type Row = BTreeMap<String, serde_json::Value>;

#[derive(Default)]
struct DestinationInner {
    /// Raw batches by batch id; a batch is replaced wholesale on retry.
    raw_batches: BTreeMap<i64, Vec<RawRow>>,
    /// Normalized state: table name to primary-key-json to row.
    tables: HashMap<String, BTreeMap<String, Row>>,
    /// Columns added by schema-delta replay, per destination table.
    added_columns: HashMap<String, Vec<String>>,
    qrep_truncations: usize,
}

/// In-memory destination executing raw-append plus merge semantics.
#[derive(Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<DestinationInner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// All raw rows of one batch, in landed order.
    pub fn raw_batch(&self, batch_id: i64) -> Vec<RawRow> {
        self.inner
            .lock()
            .raw_batches
            .get(&batch_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn raw_row_count(&self) -> usize {
        self.inner.lock().raw_batches.values().map(Vec::len).sum()
    }

    /// Current normalized rows of a table, ordered by primary key.
    pub fn table_rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Looks up one normalized row by its primary-key value.
    pub fn row(&self, table: &str, pk: &serde_json::Value) -> Option<Row> {
        let key = pk.to_string();
        self.inner
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(&key))
            .cloned()
    }

    pub fn added_columns(&self, table: &str) -> Vec<String> {
        self.inner
            .lock()
            .added_columns
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn truncation_count(&self) -> usize {
        self.inner.lock().qrep_truncations
    }

    fn pk_key(schema: &TableSchema, data: &serde_json::Value) -> Option<String> {
        let mut parts = Vec::with_capacity(schema.primary_key_columns.len());
        for column in &schema.primary_key_columns {
            parts.push(data.get(column)?.clone());
        }
        if parts.len() == 1 {
            Some(parts.remove(0).to_string())
        } else {
            Some(serde_json::Value::Array(parts).to_string())
        }
    }
}

impl CdcSync for MemoryDestination {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn setup_raw_table(&self, _mirror_name: &str) -> SluiceResult<()> {
        Ok(())
    }

    async fn sync_batch(
        &self,
        _mirror_name: &str,
        batch_id: i64,
        rows: Vec<RawRow>,
    ) -> SluiceResult<()> {
        // Replacing the whole batch makes retries idempotent: a partial
        // earlier attempt is overwritten, never appended to.
        self.inner.lock().raw_batches.insert(batch_id, rows);
        Ok(())
    }

    async fn replay_schema_deltas(
        &self,
        _mirror_name: &str,
        deltas: &[SchemaDelta],
    ) -> SluiceResult<()> {
        let mut inner = self.inner.lock();
        for delta in deltas {
            let added = inner
                .added_columns
                .entry(delta.destination_table.clone())
                .or_default();
            for column in &delta.added_columns {
                if !added.contains(&column.name) {
                    added.push(column.name.clone());
                }
            }
        }
        Ok(())
    }

    async fn remove_table_entries(
        &self,
        _mirror_name: &str,
        destination_tables: &[String],
        normalize_batch_id: i64,
        sync_batch_id: i64,
    ) -> SluiceResult<()> {
        let mut inner = self.inner.lock();
        for (batch_id, rows) in inner.raw_batches.iter_mut() {
            if *batch_id > normalize_batch_id && *batch_id <= sync_batch_id {
                rows.retain(|row| !destination_tables.contains(&row.destination_table_name));
            }
        }
        Ok(())
    }

    async fn drop_mirror_state(&self, _mirror_name: &str) -> SluiceResult<()> {
        let mut inner = self.inner.lock();
        inner.raw_batches.clear();
        inner.tables.clear();
        Ok(())
    }
}

impl CdcNormalize for MemoryDestination {
    async fn setup_normalized_tables(
        &self,
        request: &NormalizeRequest,
        resync: bool,
    ) -> SluiceResult<()> {
        let mut inner = self.inner.lock();
        for table in request.table_schemas.keys() {
            let name = if resync {
                format!("{table}_resync")
            } else {
                table.clone()
            };
            inner.tables.entry(name).or_default();
        }
        Ok(())
    }

    async fn normalize_batch(&self, request: &NormalizeRequest) -> SluiceResult<NormalizeOutcome> {
        let mut inner = self.inner.lock();
        let rows = inner
            .raw_batches
            .get(&request.batch_id)
            .cloned()
            .unwrap_or_default();

        // Group by destination table, keeping arrival order within groups.
        let mut by_table: HashMap<&str, Vec<&RawRow>> = HashMap::new();
        for row in &rows {
            if row.data.is_empty() {
                continue;
            }
            by_table
                .entry(row.destination_table_name.as_str())
                .or_default()
                .push(row);
        }

        let mut tables_merged = Vec::new();
        for (table, raw_rows) in by_table {
            let Some(schema) = request.table_schemas.get(table) else {
                continue;
            };

            // Latest record per primary key wins; ties on timestamp break by
            // uid, which encodes arrival order.
            let mut winners: BTreeMap<String, &RawRow> = BTreeMap::new();
            for row in raw_rows {
                let data: serde_json::Value = serde_json::from_str(&row.data)?;
                let Some(key) = Self::pk_key(schema, &data) else {
                    continue;
                };
                match winners.get(&key) {
                    Some(current)
                        if (current.timestamp, current.uid.as_str())
                            >= (row.timestamp, row.uid.as_str()) => {}
                    _ => {
                        winners.insert(key, row);
                    }
                }
            }

            let destination = inner.tables.entry(table.to_string()).or_default();

            for (key, row) in winners {
                let data: serde_json::Value = serde_json::from_str(&row.data)?;

                if row.record_type == 2 {
                    match &request.soft_delete_col_name {
                        Some(soft_delete_col) => {
                            // A delete for a row that never landed still
                            // inserts, flagged, from the delete's row image.
                            let existing = destination.entry(key).or_insert_with(|| {
                                data.as_object()
                                    .map(|object| {
                                        object
                                            .iter()
                                            .map(|(k, v)| (k.clone(), v.clone()))
                                            .collect()
                                    })
                                    .unwrap_or_default()
                            });
                            existing.insert(
                                soft_delete_col.clone(),
                                serde_json::Value::Bool(true),
                            );
                            if let Some(synced_at) = &request.synced_at_col_name {
                                existing
                                    .insert(synced_at.clone(), serde_json::json!("merged"));
                            }
                        }
                        None => {
                            destination.remove(&key);
                        }
                    }
                    continue;
                }

                let unchanged: HashSet<&str> = if row.unchanged_toast_columns.is_empty() {
                    HashSet::new()
                } else {
                    row.unchanged_toast_columns.split(',').collect()
                };

                let entry = destination.entry(key).or_default();
                if let Some(object) = data.as_object() {
                    for (column, value) in object {
                        if unchanged.contains(column.as_str()) {
                            continue;
                        }
                        entry.insert(column.clone(), value.clone());
                    }
                }
                if let Some(soft_delete_col) = &request.soft_delete_col_name {
                    entry.insert(soft_delete_col.clone(), serde_json::Value::Bool(false));
                }
                if let Some(synced_at) = &request.synced_at_col_name {
                    entry.insert(synced_at.clone(), serde_json::json!("merged"));
                }
            }

            tables_merged.push(table.to_string());
        }

        Ok(NormalizeOutcome { tables_merged })
    }
}

impl QRepSync for MemoryDestination {
    async fn truncate_destination(&self, destination_table: &str) -> SluiceResult<()> {
        let mut inner = self.inner.lock();
        inner.qrep_truncations += 1;
        inner
            .tables
            .entry(destination_table.to_string())
            .or_default()
            .clear();
        Ok(())
    }

    async fn sync_partition(
        &self,
        _mirror_name: &str,
        destination_table: &str,
        _partition_id: &str,
        schema: &TableSchema,
        rows: Vec<RecordItems>,
        _upsert: bool,
    ) -> SluiceResult<u64> {
        let mut inner = self.inner.lock();
        let table = inner
            .tables
            .entry(destination_table.to_string())
            .or_default();

        let mut written = 0u64;
        for items in rows {
            let data = items.to_json();
            let Some(key) = Self::pk_key(schema, &data) else {
                continue;
            };
            let row: Row = data
                .as_object()
                .map(|object| object.clone().into_iter().collect())
                .unwrap_or_default();
            table.insert(key, row);
            written += 1;
        }

        Ok(written)
    }
}

impl RenameTables for MemoryDestination {
    async fn rename_tables(
        &self,
        _mirror_name: &str,
        renames: &[(String, String)],
        _table_schemas: &HashMap<String, TableSchema>,
        soft_delete_col_name: Option<&str>,
    ) -> SluiceResult<()> {
        let mut inner = self.inner.lock();

        for (from, to) in renames {
            let Some(mut resynced) = inner.tables.remove(from) else {
                continue;
            };

            // Rows missing from the resynced set carry over soft-deleted.
            if let Some(soft_delete_col) = soft_delete_col_name
                && let Some(original) = inner.tables.get(to)
            {
                for (key, row) in original {
                    if !resynced.contains_key(key) {
                        let mut row = row.clone();
                        row.insert(soft_delete_col.to_string(), serde_json::Value::Bool(true));
                        resynced.insert(key.clone(), row);
                    }
                }
            }

            inner.tables.insert(to.clone(), resynced);
        }

        Ok(())
    }
}

impl ValidateDestination for MemoryDestination {
    async fn validate_mirror_destination(
        &self,
        _table_schemas: &HashMap<String, TableSchema>,
    ) -> SluiceResult<()> {
        Ok(())
    }
}
