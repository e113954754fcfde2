use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::batch::{BatchConfig, SnapshotConfig};
use crate::environment::EnvMap;
use crate::validation::ValidationError;

/// Which value/type system the mirror renders source columns with.
///
/// The portable system maps every source type into the engine's own value
/// model; the passthrough system keeps Postgres wire types end to end and is
/// only valid for Postgres-to-Postgres mirrors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeSystem {
    #[default]
    Portable,
    PostgresPassthrough,
}

/// Mapping from one source table to one destination table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TableMapping {
    /// Source identifier, `schema.table` for relational sources or
    /// `collection` for document sources.
    pub source_identifier: String,
    /// Destination identifier in the destination's naming scheme.
    pub destination_identifier: String,
    /// Watermark column used when this table is bulk-copied.
    #[serde(default)]
    pub partition_key: Option<String>,
    /// Columns never replicated for this table.
    #[serde(default)]
    pub excluded_columns: Vec<String>,
    /// Per-column destination type overrides, keyed by source column name.
    #[serde(default)]
    pub column_overrides: HashMap<String, String>,
    /// Destination-side table engine override (ClickHouse only).
    #[serde(default)]
    pub engine: Option<String>,
    /// Destination-side sharding key override.
    #[serde(default)]
    pub sharding_key: Option<String>,
}

impl TableMapping {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source_identifier: source.into(),
            destination_identifier: destination.into(),
            partition_key: None,
            excluded_columns: Vec::new(),
            column_overrides: HashMap::new(),
            engine: None,
            sharding_key: None,
        }
    }
}

/// Configuration of one CDC mirror (flow job).
///
/// This intentionally does not implement [`Serialize`]: the mirror references
/// peers by name only, but the environment map may carry operator-supplied
/// values that should not leak into serialized forms by accident.
#[derive(Clone, Debug, Deserialize)]
pub struct MirrorConfig {
    /// Unique mirror name; also used to derive slot, publication and raw-table
    /// names, so it is restricted to identifier-safe characters by `validate`.
    pub name: String,
    /// Name of the source peer in the catalog.
    pub source_peer: String,
    /// Name of the destination peer in the catalog.
    pub destination_peer: String,
    /// Ordered table mappings; order is preserved for snapshot scheduling.
    pub table_mappings: Vec<TableMapping>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Perform the initial snapshot before streaming.
    #[serde(default = "default_true")]
    pub do_initial_snapshot: bool,
    /// Stop after the snapshot instead of streaming changes.
    #[serde(default)]
    pub initial_snapshot_only: bool,
    /// When set, deletes flip this boolean column instead of removing rows.
    #[serde(default)]
    pub soft_delete_col_name: Option<String>,
    /// When set, merges stamp this column with the merge time.
    #[serde(default)]
    pub synced_at_col_name: Option<String>,
    #[serde(default)]
    pub type_system: TypeSystem,
    /// Rebuild destination tables under `_resync` names, then swap.
    #[serde(default)]
    pub resync: bool,
    /// Mutable per-mirror environment overrides.
    #[serde(default)]
    pub env: EnvMap,
}

impl MirrorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::MissingField {
                field: "name".to_string(),
            });
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ValidationError::invalid(
                "name",
                "must contain only alphanumerics, '_' or '-'",
            ));
        }
        if self.table_mappings.is_empty() {
            return Err(ValidationError::MissingField {
                field: "table_mappings".to_string(),
            });
        }
        self.batch.validate()?;
        self.snapshot.validate()?;

        if self.initial_snapshot_only && !self.do_initial_snapshot {
            return Err(ValidationError::invalid(
                "initial_snapshot_only",
                "requires do_initial_snapshot",
            ));
        }

        Ok(())
    }

    /// Returns the destination identifier mapped for `source_identifier`, if any.
    pub fn destination_for(&self, source_identifier: &str) -> Option<&str> {
        self.table_mappings
            .iter()
            .find(|m| m.source_identifier == source_identifier)
            .map(|m| m.destination_identifier.as_str())
    }
}

/// Write disposition for QRep partitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QRepWriteMode {
    #[default]
    Append,
    Upsert,
    /// Truncate the destination once before the first partition of a run.
    Overwrite,
}

/// Configuration of one bulk query-replication mirror.
#[derive(Clone, Debug, Deserialize)]
pub struct QRepMirrorConfig {
    pub name: String,
    pub source_peer: String,
    pub destination_peer: String,
    /// Source query or table; `{{.start}}`/`{{.end}}` expand per partition.
    pub query: String,
    pub destination_identifier: String,
    /// Column the partitioner splits on.
    pub watermark_column: String,
    #[serde(default = "default_rows_per_partition")]
    pub num_rows_per_partition: u64,
    #[serde(default = "default_qrep_parallel_workers")]
    pub max_parallel_workers: u16,
    /// Seconds slept between waves of parallel partitions.
    #[serde(default = "default_wait_between_batches_secs")]
    pub wait_between_batches_secs: u64,
    #[serde(default)]
    pub write_mode: QRepWriteMode,
}

impl QRepMirrorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.watermark_column.is_empty() {
            return Err(ValidationError::MissingField {
                field: "watermark_column".to_string(),
            });
        }
        if self.num_rows_per_partition == 0 {
            return Err(ValidationError::invalid(
                "num_rows_per_partition",
                "must be greater than 0",
            ));
        }
        if self.max_parallel_workers == 0 {
            return Err(ValidationError::invalid(
                "max_parallel_workers",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_rows_per_partition() -> u64 {
    SnapshotConfig::DEFAULT_ROWS_PER_PARTITION
}

fn default_qrep_parallel_workers() -> u16 {
    SnapshotConfig::DEFAULT_MAX_PARALLEL_WORKERS
}

fn default_wait_between_batches_secs() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror_json() -> &'static str {
        r#"{
            "name": "orders_to_ch",
            "source_peer": "pg_main",
            "destination_peer": "ch_analytics",
            "table_mappings": [
                {
                    "source_identifier": "public.orders",
                    "destination_identifier": "orders"
                }
            ]
        }"#
    }

    #[test]
    fn mirror_config_deserializes_with_defaults() {
        let config: MirrorConfig = serde_json::from_str(mirror_json()).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.do_initial_snapshot);
        assert!(!config.initial_snapshot_only);
        assert_eq!(config.batch.max_batch_size, BatchConfig::DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(config.destination_for("public.orders"), Some("orders"));
    }

    #[test]
    fn mirror_name_characters_are_restricted() {
        let mut config: MirrorConfig = serde_json::from_str(mirror_json()).unwrap();
        config.name = "bad name!".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn snapshot_only_requires_snapshot() {
        let mut config: MirrorConfig = serde_json::from_str(mirror_json()).unwrap();
        config.do_initial_snapshot = false;
        config.initial_snapshot_only = true;
        assert!(config.validate().is_err());
    }
}
