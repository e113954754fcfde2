use serde::{Deserialize, Serialize};

use crate::validation::ValidationError;

/// Batch sizing for the CDC sync step.
///
/// A sync step pulls records until either `max_batch_size` records have been
/// accepted or `idle_timeout_secs` elapses without a new record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Maximum number of records accepted into one sync batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Seconds of source silence after which the current batch flushes.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl BatchConfig {
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 250_000;
    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_batch_size == 0 {
            return Err(ValidationError::invalid(
                "batch.max_batch_size",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// Tuning for the initial snapshot performed through the QRep partitioner.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SnapshotConfig {
    /// Upper bound on rows per snapshot partition.
    #[serde(default = "default_rows_per_partition")]
    pub num_rows_per_partition: u64,
    /// Partitions copied concurrently per table.
    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: u16,
    /// Tables snapshotted concurrently.
    #[serde(default = "default_tables_in_parallel")]
    pub num_tables_in_parallel: u16,
}

impl SnapshotConfig {
    pub const DEFAULT_ROWS_PER_PARTITION: u64 = 1_000_000;
    pub const DEFAULT_MAX_PARALLEL_WORKERS: u16 = 4;
    pub const DEFAULT_TABLES_IN_PARALLEL: u16 = 1;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.num_rows_per_partition == 0 {
            return Err(ValidationError::invalid(
                "snapshot.num_rows_per_partition",
                "must be greater than 0",
            ));
        }
        if self.max_parallel_workers == 0 {
            return Err(ValidationError::invalid(
                "snapshot.max_parallel_workers",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            num_rows_per_partition: default_rows_per_partition(),
            max_parallel_workers: default_max_parallel_workers(),
            num_tables_in_parallel: default_tables_in_parallel(),
        }
    }
}

fn default_max_batch_size() -> usize {
    BatchConfig::DEFAULT_MAX_BATCH_SIZE
}

fn default_idle_timeout_secs() -> u64 {
    BatchConfig::DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_rows_per_partition() -> u64 {
    SnapshotConfig::DEFAULT_ROWS_PER_PARTITION
}

fn default_max_parallel_workers() -> u16 {
    SnapshotConfig::DEFAULT_MAX_PARALLEL_WORKERS
}

fn default_tables_in_parallel() -> u16 {
    SnapshotConfig::DEFAULT_TABLES_IN_PARALLEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = BatchConfig {
            max_batch_size: 0,
            idle_timeout_secs: 10,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_validate() {
        assert!(BatchConfig::default().validate().is_ok());
        assert!(SnapshotConfig::default().validate().is_ok());
    }
}
