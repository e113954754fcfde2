//! Shared configuration types for sluice mirrors and peers.
//!
//! Everything in this crate is plain data: peer connection settings, mirror
//! definitions and tuning knobs. Driver-specific conversions live next to the
//! drivers in the engine crates so that this crate stays serde-only.

mod batch;
mod environment;
mod mirror;
mod peer;
mod validation;

pub use batch::{BatchConfig, SnapshotConfig};
pub use environment::EnvMap;
pub use mirror::{MirrorConfig, QRepMirrorConfig, QRepWriteMode, TableMapping, TypeSystem};
pub use peer::{
    BigQueryConfig, ClickHouseConfig, ElasticsearchConfig, EventHubsConfig, KafkaConfig,
    MongoConfig, MySqlConfig, Peer, PeerConfig, PeerKind, PostgresConfig, PubSubConfig, S3Config,
    SnowflakeConfig,
};
pub use validation::ValidationError;
