use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use sluice_config::MirrorConfig;
use tracing::{debug, info};

use crate::buffer::ChangeBuffer;
use crate::catalog::Catalog;
use crate::destination::NormalizeRequest;
use crate::error::SluiceResult;
use crate::metrics::{
    MIRROR_LABEL, SLUICE_LAST_NORMALIZE_BATCH_ID, SLUICE_LAST_SYNC_BATCH_ID,
    SLUICE_NORMALIZE_BATCH_DURATION_SECONDS, SLUICE_RECORDS_PULLED_TOTAL,
    SLUICE_RECORDS_SYNCED_TOTAL, SLUICE_SYNC_BATCH_DURATION_SECONDS,
};
use crate::qrep::QRepExecutor;
use crate::source::{PullRequest, ReplicationSetup};
use crate::types::{ChangeRecord, Checkpoint, RawRow, TableSchema};
use crate::workflow::{DestinationPeer, SourcePeer};

/// What one sync step did.
#[derive(Clone, Debug, Default)]
pub struct SyncStepOutcome {
    /// Batch id written, or [`None`] when the step was empty.
    pub batch_id: Option<i64>,
    pub records_synced: usize,
    pub offset_reached: Checkpoint,
}

/// The idempotent step functions of one mirror, exposed to the workflow
/// engine as activities identified by `(mirror_name, batch_id)`.
pub struct MirrorActivities<S, D, C> {
    pub source: Arc<S>,
    pub destination: Arc<D>,
    pub catalog: C,
    pub config: MirrorConfig,
}

impl<S, D, C> MirrorActivities<S, D, C>
where
    S: SourcePeer + 'static,
    D: DestinationPeer + 'static,
    C: Catalog + 'static,
{
    /// Sets up everything both sides need before the first batch: validation,
    /// replication state, raw table, normalized tables and schema snapshots.
    ///
    /// Every piece is create-if-absent, so replaying setup is safe.
    pub async fn setup(&self) -> SluiceResult<(ReplicationSetup, HashMap<String, TableSchema>)> {
        let source_tables: Vec<String> = self
            .config
            .table_mappings
            .iter()
            .map(|m| m.source_identifier.clone())
            .collect();
        self.source.validate_mirror_source(&source_tables).await?;

        let mut table_schemas = HashMap::new();
        for mapping in &self.config.table_mappings {
            let schema = match self
                .catalog
                .load_table_schema(&self.config.name, &mapping.source_identifier)
                .await?
            {
                Some(schema) => schema,
                None => {
                    let schema = self
                        .source
                        .table_schema(
                            &mapping.source_identifier,
                            &mapping.destination_identifier,
                            &mapping.excluded_columns,
                        )
                        .await?;
                    self.catalog
                        .store_table_schema(
                            &self.config.name,
                            &mapping.source_identifier,
                            &schema,
                        )
                        .await?;
                    schema
                }
            };
            table_schemas.insert(mapping.destination_identifier.clone(), schema);
        }

        self.destination
            .validate_mirror_destination(&table_schemas)
            .await?;

        let cursor = self.catalog.get_cursor(&self.config.name).await?;
        let setup = self.source.setup_replication(&cursor.last_offset).await?;

        self.destination.setup_raw_table(&self.config.name).await?;
        let request = self.normalize_request(0, &table_schemas);
        self.destination
            .setup_normalized_tables(&request, self.config.resync)
            .await?;

        if cursor.last_offset.id == 0 {
            self.catalog
                .set_last_offset(&self.config.name, &setup.initial_offset)
                .await?;
        }

        info!(
            mirror = %self.config.name,
            slot = %setup.slot_name,
            tables = table_schemas.len(),
            "mirror setup complete"
        );

        Ok((setup, table_schemas))
    }

    /// One sync step: pull a bounded batch into the change buffer, flush it
    /// to the raw table as one atomic batch, then advance the cursor.
    ///
    /// Replays are safe end to end: the raw write is idempotent per batch id
    /// and the cursor update is a no-op for committed batches.
    pub async fn sync_step(
        &self,
        table_schemas: &mut HashMap<String, TableSchema>,
    ) -> SluiceResult<SyncStepOutcome> {
        let started = Instant::now();
        let cursor = self.catalog.get_cursor(&self.config.name).await?;
        let batch_id = cursor.last_sync_batch_id + 1;

        let mut buffer = ChangeBuffer::new(
            &self.config.name,
            self.config.env.buffer_spill_threshold(),
        );

        let request = PullRequest {
            batch_limit: self.config.batch.max_batch_size,
            idle_timeout: Duration::from_secs(self.config.batch.idle_timeout_secs),
        };
        let pull = self.source.pull(request, &mut buffer).await;

        let outcome = match pull {
            Ok(outcome) => outcome,
            Err(err) => {
                buffer.close();
                return Err(err);
            }
        };

        counter!(SLUICE_RECORDS_PULLED_TOTAL, MIRROR_LABEL => self.config.name.clone())
            .increment(outcome.records as u64);

        // Schema deltas must land on the destination before any batch that
        // depends on them normalizes; applying them before the raw write
        // guarantees that ordering.
        if !outcome.schema_deltas.is_empty() {
            self.destination
                .replay_schema_deltas(&self.config.name, &outcome.schema_deltas)
                .await?;

            for delta in &outcome.schema_deltas {
                if let Some(schema) = table_schemas.get_mut(&delta.destination_table) {
                    for added in &delta.added_columns {
                        if schema.column(&added.name).is_none() {
                            schema.columns.push(crate::types::ColumnSchema::new(
                                added.name.clone(),
                                added.kind,
                                -1,
                                added.nullable,
                            ));
                        }
                    }
                    self.catalog
                        .store_table_schema(&self.config.name, &delta.source_table, schema)
                        .await?;
                }
            }
        }

        let records = buffer.flush_ordered()?;
        buffer.close();

        if records.is_empty() {
            // Nothing landed; the offset may still have moved past empty
            // transactions and keepalives.
            if outcome.offset_reached.id > cursor.last_offset.id {
                self.catalog
                    .set_last_offset(&self.config.name, &outcome.offset_reached)
                    .await?;
                self.source.ack(&outcome.offset_reached).await?;
            }

            debug!(mirror = %self.config.name, "sync step produced no records");

            return Ok(SyncStepOutcome {
                batch_id: None,
                records_synced: 0,
                offset_reached: outcome.offset_reached,
            });
        }

        let raw_rows = render_raw_rows(&records, table_schemas, batch_id);
        let records_synced = raw_rows.len();

        self.destination
            .sync_batch(&self.config.name, batch_id, raw_rows)
            .await?;

        self.catalog
            .finish_sync_batch(&self.config.name, batch_id, &outcome.offset_reached)
            .await?;
        self.source.ack(&outcome.offset_reached).await?;

        counter!(SLUICE_RECORDS_SYNCED_TOTAL, MIRROR_LABEL => self.config.name.clone())
            .increment(records_synced as u64);
        gauge!(SLUICE_LAST_SYNC_BATCH_ID, MIRROR_LABEL => self.config.name.clone())
            .set(batch_id as f64);
        histogram!(SLUICE_SYNC_BATCH_DURATION_SECONDS, MIRROR_LABEL => self.config.name.clone())
            .record(started.elapsed().as_secs_f64());

        info!(
            mirror = %self.config.name,
            batch_id,
            records = records_synced,
            offset = %outcome.offset_reached,
            "sync batch committed"
        );

        Ok(SyncStepOutcome {
            batch_id: Some(batch_id),
            records_synced,
            offset_reached: outcome.offset_reached,
        })
    }

    /// One normalize step: merge every raw batch in `(last_norm, last_sync]`
    /// into the normalized tables, in strictly ascending batch order,
    /// advancing the cursor only after all tables of a batch succeed.
    pub async fn normalize_step(
        &self,
        table_schemas: &HashMap<String, TableSchema>,
    ) -> SluiceResult<()> {
        let cursor = self.catalog.get_cursor(&self.config.name).await?;
        if cursor.last_normalize_batch_id >= cursor.last_sync_batch_id {
            return Ok(());
        }

        for batch_id in (cursor.last_normalize_batch_id + 1)..=cursor.last_sync_batch_id {
            let started = Instant::now();
            let request = self.normalize_request(batch_id, table_schemas);

            let outcome = self.destination.normalize_batch(&request).await?;
            self.catalog
                .finish_normalize_batch(&self.config.name, batch_id)
                .await?;

            gauge!(SLUICE_LAST_NORMALIZE_BATCH_ID, MIRROR_LABEL => self.config.name.clone())
                .set(batch_id as f64);
            histogram!(
                SLUICE_NORMALIZE_BATCH_DURATION_SECONDS,
                MIRROR_LABEL => self.config.name.clone()
            )
            .record(started.elapsed().as_secs_f64());

            info!(
                mirror = %self.config.name,
                batch_id,
                tables = outcome.tables_merged.len(),
                "normalize batch committed"
            );
        }

        Ok(())
    }

    /// Runs the initial snapshot for every mapped table that has a partition
    /// key, using the query-replication machinery. Up to
    /// `snapshot.num_tables_in_parallel` tables copy at once.
    pub async fn snapshot(
        &self,
        table_schemas: &HashMap<String, TableSchema>,
    ) -> SluiceResult<()> {
        let snapshot_tables: Vec<(sluice_config::QRepMirrorConfig, TableSchema)> = self
            .config
            .table_mappings
            .iter()
            .filter_map(|mapping| {
                let partition_key = mapping.partition_key.as_ref()?;
                let schema = table_schemas.get(&mapping.destination_identifier)?;

                let qrep_config = sluice_config::QRepMirrorConfig {
                    name: format!(
                        "{}_snapshot_{}",
                        self.config.name, mapping.destination_identifier
                    ),
                    source_peer: self.config.source_peer.clone(),
                    destination_peer: self.config.destination_peer.clone(),
                    query: mapping.source_identifier.clone(),
                    destination_identifier: mapping.destination_identifier.clone(),
                    watermark_column: partition_key.clone(),
                    num_rows_per_partition: self.config.snapshot.num_rows_per_partition,
                    max_parallel_workers: self.config.snapshot.max_parallel_workers,
                    wait_between_batches_secs: 0,
                    write_mode: sluice_config::QRepWriteMode::Append,
                };

                Some((qrep_config, schema.clone()))
            })
            .collect();

        let tables_in_parallel = self.config.snapshot.num_tables_in_parallel.max(1) as usize;
        for wave in snapshot_tables.chunks(tables_in_parallel) {
            let mut join_set = tokio::task::JoinSet::new();

            for (qrep_config, schema) in wave.iter().cloned() {
                let executor = QRepExecutor {
                    source: Arc::clone(&self.source),
                    destination: Arc::clone(&self.destination),
                    catalog: self.catalog.clone(),
                };
                let mirror_name = self.config.name.clone();
                let env = self.config.env.clone();

                join_set.spawn(async move {
                    let rows = executor.run(&qrep_config, &schema, &env).await?;
                    info!(
                        mirror = %mirror_name,
                        table = %qrep_config.destination_identifier,
                        rows,
                        "snapshot table copied"
                    );
                    Ok::<(), crate::error::SluiceError>(())
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) => result?,
                    Err(join_err) => {
                        return Err(crate::sluice_error!(
                            crate::error::ErrorKind::WorkerPanic,
                            "Snapshot worker died",
                            join_err.to_string()
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Swaps `_resync` tables into place after a resync snapshot.
    pub async fn rename_tables(
        &self,
        table_schemas: &HashMap<String, TableSchema>,
    ) -> SluiceResult<()> {
        let renames: Vec<(String, String)> = self
            .config
            .table_mappings
            .iter()
            .map(|mapping| {
                (
                    format!("{}_resync", mapping.destination_identifier),
                    mapping.destination_identifier.clone(),
                )
            })
            .collect();

        self.destination
            .rename_tables(
                &self.config.name,
                &renames,
                table_schemas,
                self.config.soft_delete_col_name.as_deref(),
            )
            .await
    }

    /// Tears the mirror down: source replication state, destination raw
    /// state and catalog rows.
    pub async fn drop_mirror(&self) -> SluiceResult<()> {
        self.source.cleanup(&self.config.name).await?;
        self.destination
            .drop_mirror_state(&self.config.name)
            .await?;
        self.catalog.drop_mirror(&self.config.name).await?;

        info!(mirror = %self.config.name, "mirror dropped");

        Ok(())
    }

    fn normalize_request(
        &self,
        batch_id: i64,
        table_schemas: &HashMap<String, TableSchema>,
    ) -> NormalizeRequest {
        NormalizeRequest {
            mirror_name: self.config.name.clone(),
            batch_id,
            table_schemas: table_schemas.clone(),
            soft_delete_col_name: self.config.soft_delete_col_name.clone(),
            synced_at_col_name: self.config.synced_at_col_name.clone(),
            merge_parallelism: self.config.env.merge_parallelism(),
        }
    }
}

/// Renders buffered records into raw rows with arrival-ordered uids.
///
/// The uid embeds the batch id and the position within the batch in fixed
/// width hex, so lexical uid order equals arrival order, which is the tie
/// break the merge's rank window relies on.
fn render_raw_rows(
    records: &[ChangeRecord],
    table_schemas: &HashMap<String, TableSchema>,
    batch_id: i64,
) -> Vec<RawRow> {
    let mut rows = Vec::with_capacity(records.len());

    for (position, record) in records.iter().enumerate() {
        let Some(schema) = table_schemas.get(&record.meta().destination_table) else {
            continue;
        };

        let uid = format!("{batch_id:016x}-{position:012x}");
        if let Some(row) = record.to_raw_row(schema, batch_id, uid) {
            rows.push(row);
        }
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeMeta, ColumnSchema, RecordItems, Value, ValueKind};
    use chrono::Utc;

    #[test]
    fn raw_row_uids_sort_in_arrival_order() {
        let schema = TableSchema::new(
            "orders",
            vec![ColumnSchema::new("id", ValueKind::Int64, -1, false)],
            vec!["id".to_string()],
        );
        let mut table_schemas = HashMap::new();
        table_schemas.insert("orders".to_string(), schema);

        let records: Vec<ChangeRecord> = (0..300)
            .map(|i| {
                let mut items = RecordItems::new();
                items.insert("id", Value::Int64(i));
                ChangeRecord::Insert {
                    meta: ChangeMeta {
                        checkpoint: crate::types::Checkpoint::new(100),
                        commit_time: Utc::now(),
                        source_table: "public.orders".to_string(),
                        destination_table: "orders".to_string(),
                    },
                    items,
                }
            })
            .collect();

        let rows = render_raw_rows(&records, &table_schemas, 42);
        assert_eq!(rows.len(), 300);

        let mut uids: Vec<&str> = rows.iter().map(|r| r.uid.as_str()).collect();
        let original = uids.clone();
        uids.sort();
        assert_eq!(uids, original);
        assert!(rows.iter().all(|r| r.batch_id == 42));
    }

    #[test]
    fn unmapped_tables_are_skipped() {
        let records = vec![ChangeRecord::Insert {
            meta: ChangeMeta {
                checkpoint: crate::types::Checkpoint::new(1),
                commit_time: Utc::now(),
                source_table: "public.unknown".to_string(),
                destination_table: "unknown".to_string(),
            },
            items: RecordItems::new(),
        }];

        let rows = render_raw_rows(&records, &HashMap::new(), 1);
        assert!(rows.is_empty());
    }
}
