//! S3: Avro object sink for mirrors, and the staging client warehouses use
//! for `COPY INTO`-style batch loads.

mod core;

pub use core::{S3Destination, S3StagingClient};
