//! Merge-statement generation for normalize steps.
//!
//! One MERGE is generated per `(batch, destination table)`. The statement
//! pipeline is: project the raw JSON into typed columns, deduplicate to one
//! row per primary key (latest wins), then merge with one `WHEN MATCHED`
//! branch per distinct unchanged-TOAST column set so preserved columns are
//! never overwritten.

mod merge;

pub use merge::{MergeDialect, MergeStatementGenerator, BigQueryDialect, SnowflakeDialect};
