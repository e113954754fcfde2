//! Metric names and registration for the engine.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use std::sync::Once;

pub const MIRROR_LABEL: &str = "mirror";
pub const TABLE_LABEL: &str = "table";
pub const PEER_LABEL: &str = "peer";

pub const SLUICE_RECORDS_PULLED_TOTAL: &str = "sluice_records_pulled_total";
pub const SLUICE_RECORDS_SYNCED_TOTAL: &str = "sluice_records_synced_total";
pub const SLUICE_SYNC_BATCH_DURATION_SECONDS: &str = "sluice_sync_batch_duration_seconds";
pub const SLUICE_NORMALIZE_BATCH_DURATION_SECONDS: &str =
    "sluice_normalize_batch_duration_seconds";
pub const SLUICE_BUFFER_SPILLED_RECORDS: &str = "sluice_buffer_spilled_records";
pub const SLUICE_LAST_SYNC_BATCH_ID: &str = "sluice_last_sync_batch_id";
pub const SLUICE_LAST_NORMALIZE_BATCH_ID: &str = "sluice_last_normalize_batch_id";
pub const SLUICE_SCHEMA_DELTAS_TOTAL: &str = "sluice_schema_deltas_total";
pub const SLUICE_QREP_PARTITIONS_DONE_TOTAL: &str = "sluice_qrep_partitions_done_total";
pub const SLUICE_ERRORS_CLASSIFIED_TOTAL: &str = "sluice_errors_classified_total";

static REGISTER: Once = Once::new();

/// Describes all engine metrics exactly once per process.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        describe_counter!(
            SLUICE_RECORDS_PULLED_TOTAL,
            "Change records accepted from the source stream"
        );
        describe_counter!(
            SLUICE_RECORDS_SYNCED_TOTAL,
            "Change records durably written to the raw table"
        );
        describe_histogram!(
            SLUICE_SYNC_BATCH_DURATION_SECONDS,
            "Wall-clock duration of one sync step"
        );
        describe_histogram!(
            SLUICE_NORMALIZE_BATCH_DURATION_SECONDS,
            "Wall-clock duration of one normalize step"
        );
        describe_gauge!(
            SLUICE_BUFFER_SPILLED_RECORDS,
            "Records currently held in the change-buffer spill store"
        );
        describe_gauge!(SLUICE_LAST_SYNC_BATCH_ID, "Last committed sync batch id");
        describe_gauge!(
            SLUICE_LAST_NORMALIZE_BATCH_ID,
            "Last committed normalize batch id"
        );
        describe_counter!(
            SLUICE_SCHEMA_DELTAS_TOTAL,
            "Schema deltas detected in the source stream"
        );
        describe_counter!(
            SLUICE_QREP_PARTITIONS_DONE_TOTAL,
            "QRep partitions marked complete"
        );
        describe_counter!(
            SLUICE_ERRORS_CLASSIFIED_TOTAL,
            "Errors routed through the classifier, labeled by class"
        );
    });
}
