//! Bulk query-replication: watermark partition planning and execution.
//!
//! A run discovers the watermark range, splits it into inclusive partitions
//! of at most `num_rows_per_partition` rows (assuming an even spread), and
//! executes non-completed partitions in bounded parallel waves. Completion is
//! persisted per partition, so a restarted run re-executes only what never
//! finished. A failed partition poisons only itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use sluice_config::{EnvMap, QRepMirrorConfig, QRepWriteMode};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::destination::QRepSync;
use crate::error::{ErrorKind, SluiceResult};
use crate::metrics::{MIRROR_LABEL, SLUICE_QREP_PARTITIONS_DONE_TOTAL};
use crate::source::{QRepPull, WatermarkStats};
use crate::types::TableSchema;
use crate::{bail, sluice_error};

/// A value of the watermark column, one variant per supported column family.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PartitionValue {
    Int(i64),
    UInt(u64),
    Timestamp(DateTime<Utc>),
    /// Physical row location `(block, offset)` for TID scans.
    Tid(u32, u16),
    /// Document object id, kept opaque.
    ObjectId(String),
}

impl PartitionValue {
    /// Token used inside stable partition ids and catalog range columns.
    pub fn to_token(&self) -> String {
        match self {
            PartitionValue::Int(v) => format!("i:{v}"),
            PartitionValue::UInt(v) => format!("u:{v}"),
            PartitionValue::Timestamp(v) => format!("t:{}", v.timestamp_micros()),
            PartitionValue::Tid(block, offset) => format!("tid:{block}:{offset}"),
            PartitionValue::ObjectId(v) => format!("oid:{v}"),
        }
    }
}

/// One inclusive `[start, end]` partition of the watermark range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Stable identifier derived from the range, identical across restarts.
    pub id: String,
    pub start: PartitionValue,
    pub end: PartitionValue,
}

impl Partition {
    fn new(start: PartitionValue, end: PartitionValue) -> Self {
        Self {
            id: format!("{}_{}", start.to_token(), end.to_token()),
            start,
            end,
        }
    }
}

/// Splits the watermark range into at most `num_rows_per_partition`-row
/// chunks, assuming rows spread evenly over the value range.
pub fn plan_partitions(
    stats: &WatermarkStats,
    num_rows_per_partition: u64,
) -> SluiceResult<Vec<Partition>> {
    if stats.row_count == 0 {
        return Ok(Vec::new());
    }

    let chunks = stats.row_count.div_ceil(num_rows_per_partition).max(1);

    let partitions = match (&stats.min, &stats.max) {
        (PartitionValue::Int(min), PartitionValue::Int(max)) => {
            split_i64(*min, *max, chunks)
                .into_iter()
                .map(|(s, e)| Partition::new(PartitionValue::Int(s), PartitionValue::Int(e)))
                .collect()
        }
        (PartitionValue::UInt(min), PartitionValue::UInt(max)) => {
            split_u64(*min, *max, chunks)
                .into_iter()
                .map(|(s, e)| Partition::new(PartitionValue::UInt(s), PartitionValue::UInt(e)))
                .collect()
        }
        (PartitionValue::Timestamp(min), PartitionValue::Timestamp(max)) => {
            split_i64(min.timestamp_micros(), max.timestamp_micros(), chunks)
                .into_iter()
                .filter_map(|(s, e)| {
                    let start = DateTime::from_timestamp_micros(s)?;
                    let end = DateTime::from_timestamp_micros(e)?;
                    Some(Partition::new(
                        PartitionValue::Timestamp(start),
                        PartitionValue::Timestamp(end),
                    ))
                })
                .collect()
        }
        (PartitionValue::Tid(min_block, _), PartitionValue::Tid(max_block, max_offset)) => {
            split_u64(*min_block as u64, *max_block as u64, chunks)
                .into_iter()
                .map(|(s, e)| {
                    let end_offset = if e == *max_block as u64 { *max_offset } else { u16::MAX };
                    Partition::new(
                        PartitionValue::Tid(s as u32, 0),
                        PartitionValue::Tid(e as u32, end_offset),
                    )
                })
                .collect()
        }
        // Object ids are opaque: one partition covers the whole range.
        (PartitionValue::ObjectId(_), PartitionValue::ObjectId(_)) => {
            vec![Partition::new(stats.min.clone(), stats.max.clone())]
        }
        (min, max) => {
            bail!(
                ErrorKind::ValidationError,
                "Watermark bounds disagree on type",
                format!("min {min:?} vs max {max:?}")
            );
        }
    };

    Ok(partitions)
}

fn split_i64(min: i64, max: i64, chunks: u64) -> Vec<(i64, i64)> {
    let span = (max - min) as i128 + 1;
    let chunks = (chunks as i128).min(span).max(1);
    let step = span / chunks;
    let mut out = Vec::with_capacity(chunks as usize);
    let mut start = min as i128;
    for i in 0..chunks {
        let end = if i == chunks - 1 {
            max as i128
        } else {
            start + step - 1
        };
        out.push((start as i64, end as i64));
        start = end + 1;
    }
    out
}

fn split_u64(min: u64, max: u64, chunks: u64) -> Vec<(u64, u64)> {
    split_i64(min as i64, max as i64, chunks)
        .into_iter()
        .map(|(s, e)| (s as u64, e as u64))
        .collect()
}

/// Executes one QRep run against a source/destination pair.
pub struct QRepExecutor<S, D, C> {
    pub source: Arc<S>,
    pub destination: Arc<D>,
    pub catalog: C,
}

impl<S, D, C> QRepExecutor<S, D, C>
where
    S: QRepPull + 'static,
    D: QRepSync + 'static,
    C: Catalog + 'static,
{
    /// Runs all pending partitions of `config` to completion.
    ///
    /// Partitions execute in waves of `max_parallel_workers`; between waves
    /// the executor sleeps `wait_between_batches_secs`, overridable at run
    /// time through [`EnvMap::QREP_WAIT_BETWEEN_BATCHES`]. A partition
    /// failure is recorded and does not stop the remaining partitions; the
    /// run fails at the end if any partition failed, leaving those rows
    /// incomplete for the next attempt.
    pub async fn run(
        &self,
        config: &QRepMirrorConfig,
        schema: &TableSchema,
        env: &EnvMap,
    ) -> SluiceResult<u64> {
        let stats = self
            .source
            .watermark_stats(&config.query, &config.watermark_column, None)
            .await?;

        let Some(stats) = stats else {
            info!(mirror = %config.name, "no rows past the watermark, nothing to copy");
            return Ok(0);
        };

        let partitions = plan_partitions(&stats, config.num_rows_per_partition)?;
        info!(
            mirror = %config.name,
            partitions = partitions.len(),
            rows = stats.row_count,
            "planned qrep partitions"
        );

        let mut pending = Vec::with_capacity(partitions.len());
        for partition in partitions {
            self.catalog
                .register_partition(
                    &config.name,
                    &partition.id,
                    &partition.start.to_token(),
                    &partition.end.to_token(),
                )
                .await?;

            if self.catalog.is_partition_done(&config.name, &partition.id).await? {
                info!(
                    mirror = %config.name,
                    partition = %partition.id,
                    "partition already completed, skipping"
                );
            } else {
                pending.push(partition);
            }
        }

        // Overwrite truncates exactly once, before the first partition of a
        // run that actually has work to do.
        if config.write_mode == QRepWriteMode::Overwrite && !pending.is_empty() {
            self.destination
                .truncate_destination(&config.destination_identifier)
                .await?;
        }

        let mut total_rows = 0u64;
        let mut failures: Vec<String> = Vec::new();
        let upsert = config.write_mode == QRepWriteMode::Upsert;
        let wait_between_batches_secs = env.get_u64(
            EnvMap::QREP_WAIT_BETWEEN_BATCHES,
            config.wait_between_batches_secs,
        );

        for wave in pending.chunks(config.max_parallel_workers as usize) {
            let mut join_set = JoinSet::new();

            for partition in wave.iter().cloned() {
                let source = Arc::clone(&self.source);
                let destination = Arc::clone(&self.destination);
                let catalog = self.catalog.clone();
                let config = config.clone();
                let schema = schema.clone();

                join_set.spawn(async move {
                    let rows = source
                        .pull_partition(&config.query, &config.watermark_column, &partition)
                        .await?;

                    let written = destination
                        .sync_partition(
                            &config.name,
                            &config.destination_identifier,
                            &partition.id,
                            &schema,
                            rows,
                            upsert,
                        )
                        .await?;

                    catalog.mark_partition_done(&config.name, &partition.id).await?;
                    counter!(
                        SLUICE_QREP_PARTITIONS_DONE_TOTAL,
                        MIRROR_LABEL => config.name.clone()
                    )
                    .increment(1);

                    Ok::<(String, u64), crate::error::SluiceError>((partition.id, written))
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok((partition_id, written))) => {
                        info!(
                            mirror = %config.name,
                            partition = %partition_id,
                            rows = written,
                            "partition synced"
                        );
                        total_rows += written;
                    }
                    Ok(Err(err)) => {
                        warn!(mirror = %config.name, error = %err, "partition failed");
                        failures.push(err.to_string());
                    }
                    Err(join_err) => {
                        warn!(mirror = %config.name, error = %join_err, "partition task died");
                        failures.push(join_err.to_string());
                    }
                }
            }

            if wait_between_batches_secs > 0 {
                tokio::time::sleep(Duration::from_secs(wait_between_batches_secs)).await;
            }
        }

        if !failures.is_empty() {
            return Err(sluice_error!(
                ErrorKind::QueryFailed,
                "QRep partitions failed",
                failures.join("; ")
            ));
        }

        Ok(total_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_range_splits_into_row_bounded_chunks() {
        let stats = WatermarkStats {
            min: PartitionValue::Int(1),
            max: PartitionValue::Int(100),
            row_count: 100,
        };
        let partitions = plan_partitions(&stats, 30).unwrap();
        assert_eq!(partitions.len(), 4);
        assert_eq!(partitions[0].start, PartitionValue::Int(1));
        assert_eq!(partitions[3].end, PartitionValue::Int(100));

        // Ranges are contiguous and non-overlapping.
        for pair in partitions.windows(2) {
            let (PartitionValue::Int(prev_end), PartitionValue::Int(next_start)) =
                (&pair[0].end, &pair[1].start)
            else {
                panic!("unexpected variant");
            };
            assert_eq!(prev_end + 1, *next_start);
        }
    }

    #[test]
    fn partition_ids_are_stable_across_plans() {
        let stats = WatermarkStats {
            min: PartitionValue::Int(0),
            max: PartitionValue::Int(99),
            row_count: 50,
        };
        let first = plan_partitions(&stats, 25).unwrap();
        let second = plan_partitions(&stats, 25).unwrap();
        let first_ids: Vec<&str> = first.iter().map(|p| p.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn empty_range_plans_nothing() {
        let stats = WatermarkStats {
            min: PartitionValue::Int(1),
            max: PartitionValue::Int(1),
            row_count: 0,
        };
        assert!(plan_partitions(&stats, 10).unwrap().is_empty());
    }

    #[test]
    fn narrow_range_never_produces_empty_partitions() {
        let stats = WatermarkStats {
            min: PartitionValue::Int(5),
            max: PartitionValue::Int(6),
            row_count: 1_000_000,
        };
        // Far more rows than distinct values: partitions collapse to the
        // value span.
        let partitions = plan_partitions(&stats, 10).unwrap();
        assert_eq!(partitions.len(), 2);
    }

    #[test]
    fn timestamp_range_splits() {
        let start = DateTime::from_timestamp_micros(0).unwrap();
        let end = DateTime::from_timestamp_micros(1_000_000).unwrap();
        let stats = WatermarkStats {
            min: PartitionValue::Timestamp(start),
            max: PartitionValue::Timestamp(end),
            row_count: 10,
        };
        let partitions = plan_partitions(&stats, 5).unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[1].end, PartitionValue::Timestamp(end));
    }

    #[test]
    fn object_id_range_is_a_single_partition() {
        let stats = WatermarkStats {
            min: PartitionValue::ObjectId("65000000".to_string()),
            max: PartitionValue::ObjectId("66ffffff".to_string()),
            row_count: 1_000_000,
        };
        let partitions = plan_partitions(&stats, 1000).unwrap();
        assert_eq!(partitions.len(), 1);
    }

    #[test]
    fn mismatched_bounds_are_rejected() {
        let stats = WatermarkStats {
            min: PartitionValue::Int(1),
            max: PartitionValue::UInt(10),
            row_count: 5,
        };
        assert!(plan_partitions(&stats, 10).is_err());
    }
}
