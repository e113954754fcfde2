//! Destination connectors for sluice mirrors.
//!
//! Each connector implements the subset of the engine's destination
//! capabilities its target supports:
//!
//! | Connector  | CdcSync | CdcNormalize | QRepSync | RenameTables |
//! |------------|---------|--------------|----------|--------------|
//! | ClickHouse | yes     | yes          | yes      | yes          |
//! | Snowflake  | yes     | yes          | yes      | yes          |
//! | BigQuery   | yes     | yes          | yes      | yes          |
//! | S3         | yes     | no           | yes      | no           |
//!
//! Queue peers (Kafka, Pub/Sub, Event Hubs, Elasticsearch) are modeled in
//! the peer registry but ship no driver here; loading one yields
//! [`unsupported_capability`].

pub mod bigquery;
pub mod clickhouse;
pub mod s3;
pub mod snowflake;

use sluice::error::{ErrorKind, SluiceError};
use sluice::sluice_error;
use sluice_config::PeerKind;

/// Error returned when a peer kind cannot provide a requested capability.
pub fn unsupported_capability(kind: PeerKind, capability: &str) -> SluiceError {
    sluice_error!(
        ErrorKind::UnsupportedCapability,
        "Peer does not implement the requested capability",
        format!("{kind} peers do not support {capability}")
    )
}

/// Wraps an AWS SDK error, keeping the failed operation name in the detail.
pub(crate) fn sluice_error_from_sdk(
    operation: &str,
    err: impl std::error::Error + Send + Sync + 'static,
) -> SluiceError {
    sluice_error!(
        ErrorKind::Io,
        "Object store operation failed",
        format!("{operation}: {err}")
    )
    .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_capability_is_typed() {
        let err = unsupported_capability(PeerKind::Kafka, "CdcNormalize");
        assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);
        assert!(err.to_string().contains("kafka"));
    }
}
