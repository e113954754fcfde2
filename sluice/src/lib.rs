//! Change-data-capture and bulk query-replication engine.
//!
//! A mirror streams rows from a relational or document source into an
//! analytical destination by landing change records in an append-only raw
//! table and merging them, batch by batch, into normalized tables. Bulk
//! copies run through the query-replication partitioner instead.
//!
//! The engine is structured around narrow capability traits implemented by
//! concrete peers ([`source`], [`destination`]), a spillable [`buffer`] that
//! collapses changes per primary key within a sync step, a durable
//! [`catalog`] carrying the only state needed to resume, and a [`workflow`]
//! controller that drives `(sync, normalize)` iterations as idempotent
//! activities.

pub mod buffer;
pub mod catalog;
pub mod classifier;
pub mod concurrency;
pub mod destination;
pub mod error;
pub mod macros;
pub mod metrics;
pub mod normalize;
pub mod qrep;
pub mod schema_tracker;
pub mod source;
pub mod staging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workflow;
