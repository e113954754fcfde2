//! Destination capability traits.
//!
//! Concrete connectors live in the destinations crate; the in-memory test
//! peer lives in [`crate::test_utils`]. Everything here must be idempotent
//! per `(mirror, batch_id)`, because the workflow engine retries activities.

use std::collections::HashMap;
use std::future::Future;

use crate::error::SluiceResult;
use crate::types::{RawRow, RecordItems, SchemaDelta, TableSchema};

/// Everything a normalize step needs for one batch.
#[derive(Clone, Debug)]
pub struct NormalizeRequest {
    pub mirror_name: String,
    /// The single batch to merge; batches are always merged in ascending
    /// order, one request per batch.
    pub batch_id: i64,
    /// Destination table name to schema for every mapped table.
    pub table_schemas: HashMap<String, TableSchema>,
    pub soft_delete_col_name: Option<String>,
    pub synced_at_col_name: Option<String>,
    /// Upper bound on concurrently merged tables.
    pub merge_parallelism: usize,
}

/// Result of one normalize step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NormalizeOutcome {
    /// Destination tables that were merged.
    pub tables_merged: Vec<String>,
}

/// Raw-table writes for the CDC sync step.
pub trait CdcSync: Send + Sync {
    /// Human-readable connector name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Creates the raw landing table (and any staging resources) for a
    /// mirror. Safe to call repeatedly.
    fn setup_raw_table(&self, mirror_name: &str) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Appends one batch of raw rows atomically.
    ///
    /// All rows carry the same `batch_id`. Retrying a batch that already
    /// landed must leave the raw table unchanged; partially landed state from
    /// a failed attempt must be invisible or overwritten by the retry.
    fn sync_batch(
        &self,
        mirror_name: &str,
        batch_id: i64,
        rows: Vec<RawRow>,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Applies additive schema deltas to the destination tables before the
    /// affected batch normalizes. Additions are idempotent.
    fn replay_schema_deltas(
        &self,
        mirror_name: &str,
        deltas: &[SchemaDelta],
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Removes a table's raw rows in the batch range `(normalize, sync]`,
    /// used when a table is dropped from a running mirror.
    fn remove_table_entries(
        &self,
        mirror_name: &str,
        destination_tables: &[String],
        normalize_batch_id: i64,
        sync_batch_id: i64,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Drops the raw table and staging state as part of mirror teardown.
    fn drop_mirror_state(&self, mirror_name: &str)
    -> impl Future<Output = SluiceResult<()>> + Send;
}

/// Merge-based normalization of the raw table into destination tables.
pub trait CdcNormalize: Send + Sync {
    /// Creates the normalized tables for the mapped schemas. With `resync`
    /// the tables are created under `_resync` names for a later swap.
    fn setup_normalized_tables(
        &self,
        request: &NormalizeRequest,
        resync: bool,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Merges the raw rows of exactly one batch into the normalized tables.
    ///
    /// Must be idempotent: re-merging an applied batch is a no-op because
    /// the rank-dedup picks the same winning rows and the merge predicates
    /// converge.
    fn normalize_batch(
        &self,
        request: &NormalizeRequest,
    ) -> impl Future<Output = SluiceResult<NormalizeOutcome>> + Send;
}

/// Table renames used by the resync flow.
pub trait RenameTables: Send + Sync {
    /// Swaps `_resync` tables into place. When `soft_delete_col_name` is set,
    /// rows present in the old table but missing from the resynced one are
    /// carried over with the soft-delete flag raised.
    fn rename_tables(
        &self,
        mirror_name: &str,
        renames: &[(String, String)],
        table_schemas: &HashMap<String, TableSchema>,
        soft_delete_col_name: Option<&str>,
    ) -> impl Future<Output = SluiceResult<()>> + Send;
}

/// Bulk partition writes for query replication and snapshots.
pub trait QRepSync: Send + Sync {
    /// Truncates the destination once at the start of an overwrite-mode run.
    fn truncate_destination(
        &self,
        destination_table: &str,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Writes all rows of one partition. Idempotent per partition id.
    fn sync_partition(
        &self,
        mirror_name: &str,
        destination_table: &str,
        partition_id: &str,
        schema: &TableSchema,
        rows: Vec<RecordItems>,
        upsert: bool,
    ) -> impl Future<Output = SluiceResult<u64>> + Send;
}

/// Pre-flight checks run when a mirror is created.
pub trait ValidateDestination: Send + Sync {
    fn validate_mirror_destination(
        &self,
        table_schemas: &HashMap<String, TableSchema>,
    ) -> impl Future<Output = SluiceResult<()>> + Send;
}
