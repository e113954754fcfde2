//! Source capability traits and the concrete pullers.
//!
//! Peers implement only the capabilities they support; callers obtain a
//! capability at load time and get a typed error if the peer cannot provide
//! it. All methods take `&self`: pullers that need exclusive stream state use
//! interior mutability so that [`CdcPull::keepalive`] can run concurrently
//! with an active [`CdcPull::pull`].

pub mod mongo;
pub mod mysql;
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use crate::buffer::ChangeBuffer;
use crate::error::SluiceResult;
use crate::qrep::{Partition, PartitionValue};
use crate::types::{Checkpoint, RecordItems, SchemaDelta, TableSchema};

/// Result of preparing a source for replication.
#[derive(Clone, Debug)]
pub struct ReplicationSetup {
    /// Name of the replication slot / stream the source created or reused.
    pub slot_name: String,
    /// Exported snapshot usable for a consistent initial copy, if the source
    /// provides one.
    pub snapshot_name: Option<String>,
    /// Whether the source supports physical-location (TID) range scans for
    /// snapshot partitioning.
    pub supports_tid_scans: bool,
    /// Offset streaming starts from.
    pub initial_offset: Checkpoint,
}

/// Bounds for one pull call.
#[derive(Clone, Copy, Debug)]
pub struct PullRequest {
    /// Stop after this many records were accepted into the buffer.
    pub batch_limit: usize,
    /// Stop once this long passes without a new record.
    pub idle_timeout: Duration,
}

/// What one pull call produced besides the buffered records.
#[derive(Clone, Debug, Default)]
pub struct PullOutcome {
    /// Highest commit offset fully delivered into the buffer.
    pub offset_reached: Checkpoint,
    /// Schema changes observed mid-stream, in arrival order. These never
    /// enter the change buffer.
    pub schema_deltas: Vec<SchemaDelta>,
    /// Number of records accepted.
    pub records: usize,
}

/// Continuous change-data-capture from a source.
pub trait CdcPull: Send + Sync {
    /// Prepares source-side replication state (slot and publication for
    /// Postgres, binlog validation for MySQL, change stream for Mongo).
    fn setup_replication(
        &self,
        start_offset: &Checkpoint,
    ) -> impl Future<Output = SluiceResult<ReplicationSetup>> + Send;

    /// Streams records into `buffer` until the batch limit, the idle timeout
    /// or end-of-stream. Records are delivered in source commit order and
    /// `checkpoint_id` is the commit offset.
    fn pull(
        &self,
        request: PullRequest,
        buffer: &mut ChangeBuffer,
    ) -> impl Future<Output = SluiceResult<PullOutcome>> + Send;

    /// Pings the source to prevent server-side timeouts. A no-op while a pull
    /// is actively receiving.
    fn keepalive(&self) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Tells the source that records up to `offset` are durable, letting it
    /// discard retained WAL/binlog.
    fn ack(&self, offset: &Checkpoint) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Drops source-side replication state as part of mirror teardown.
    fn cleanup(&self, mirror_name: &str) -> impl Future<Output = SluiceResult<()>> + Send;
}

/// Schema discovery for mirror setup and validation.
pub trait GetTableSchema: Send + Sync {
    /// Returns the engine-facing schema for `source_identifier`, named after
    /// `destination_identifier`.
    fn table_schema(
        &self,
        source_identifier: &str,
        destination_identifier: &str,
        excluded_columns: &[String],
    ) -> impl Future<Output = SluiceResult<TableSchema>> + Send;
}

/// Watermark statistics driving QRep partition planning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatermarkStats {
    pub min: PartitionValue,
    pub max: PartitionValue,
    pub row_count: u64,
}

/// Bulk partition reads for query replication and snapshots.
pub trait QRepPull: Send + Sync {
    /// Returns min, max and row count of the watermark column past
    /// `last_end`, or [`None`] when there is nothing new to copy.
    fn watermark_stats(
        &self,
        table: &str,
        watermark_column: &str,
        last_end: Option<&PartitionValue>,
    ) -> impl Future<Output = SluiceResult<Option<WatermarkStats>>> + Send;

    /// Reads all rows of one partition.
    fn pull_partition(
        &self,
        table: &str,
        watermark_column: &str,
        partition: &Partition,
    ) -> impl Future<Output = SluiceResult<Vec<RecordItems>>> + Send;
}

/// Pre-flight checks run when a mirror is created.
pub trait ValidateSource: Send + Sync {
    fn validate_mirror_source(
        &self,
        table_identifiers: &[String],
    ) -> impl Future<Output = SluiceResult<()>> + Send;
}

/// Version reporting for the status surface.
pub trait GetVersion: Send + Sync {
    fn version(&self) -> impl Future<Output = SluiceResult<String>> + Send;
}

/// Tracks the idle-flush deadline of one pull call.
///
/// The deadline re-arms only when a change record is accepted into the
/// buffer. Protocol traffic must not postpone it: Postgres walsenders emit
/// keepalives on their own schedule and MySQL interleaves rotate, table-map
/// and transaction-marker events, so a timeout re-armed per message would
/// never fire on a chatty-but-idle source.
pub(crate) struct IdleDeadline {
    deadline: tokio::time::Instant,
    timeout: std::time::Duration,
}

impl IdleDeadline {
    pub fn start(timeout: std::time::Duration) -> Self {
        Self {
            deadline: tokio::time::Instant::now() + timeout,
            timeout,
        }
    }

    /// The instant at which the current batch flushes if no further record
    /// is accepted.
    pub fn deadline(&self) -> tokio::time::Instant {
        self.deadline
    }

    /// Re-arms the window; call only after accepting a change record.
    pub fn record_accepted(&mut self) {
        self.deadline = tokio::time::Instant::now() + self.timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn idle_deadline_survives_protocol_chatter() {
        let idle = IdleDeadline::start(Duration::from_secs(1));
        let started = tokio::time::Instant::now();

        // A keepalive every 100ms: the deadline must still fire at ~1s.
        let mut keepalives = 0;
        loop {
            let next = tokio::time::timeout_at(
                idle.deadline(),
                tokio::time::sleep(Duration::from_millis(100)),
            )
            .await;
            match next {
                Ok(()) => keepalives += 1,
                Err(_) => break,
            }
        }

        assert!(keepalives <= 10);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_deadline_rearms_only_on_accepted_records() {
        let mut idle = IdleDeadline::start(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(800)).await;
        idle.record_accepted();

        // The original deadline has long passed; the re-armed one has not.
        let within_window = tokio::time::timeout_at(
            idle.deadline(),
            tokio::time::sleep(Duration::from_millis(800)),
        )
        .await;
        assert!(within_window.is_ok());

        let expired =
            tokio::time::timeout_at(idle.deadline(), std::future::pending::<()>()).await;
        assert!(expired.is_err());
    }

    /// The pull-loop shape: two records followed by endless keepalives. The
    /// loop must flush once the idle window passes, no matter how often
    /// non-record traffic arrives.
    #[tokio::test(start_paused = true)]
    async fn pull_loop_flushes_despite_keepalive_stream() {
        enum Message {
            Record,
            Keepalive,
        }

        let stream = futures::stream::unfold(0u32, |n| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let message = if n < 2 {
                Message::Record
            } else {
                Message::Keepalive
            };
            Some((message, n + 1))
        });
        futures::pin_mut!(stream);

        let mut idle = IdleDeadline::start(Duration::from_millis(300));
        let started = tokio::time::Instant::now();
        let mut accepted = 0;

        loop {
            let next = tokio::time::timeout_at(idle.deadline(), stream.next()).await;
            match next {
                Err(_) => break,
                Ok(Some(Message::Record)) => {
                    accepted += 1;
                    idle.record_accepted();
                }
                Ok(Some(Message::Keepalive)) => {}
                Ok(None) => break,
            }
        }

        assert_eq!(accepted, 2);
        // Flushed ~300ms after the second record, not at keepalive cadence.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(500));
    }
}
