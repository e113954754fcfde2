//! BigQuery destination: raw batches through query-job inserts, merges
//! through the shared generator in the BigQuery dialect.

mod core;

pub use core::BigQueryDestination;
