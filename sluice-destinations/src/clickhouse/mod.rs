//! ClickHouse destination: raw batches over RowBinary inserts, normalization
//! through `LIMIT 1 BY` dedup inserts into ReplacingMergeTree tables.

mod client;
mod core;
mod schema;

pub use client::ClickHouseClient;
pub use core::ClickHouseDestination;
