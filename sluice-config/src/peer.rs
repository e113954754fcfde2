use serde::{Deserialize, Serialize};

use crate::validation::ValidationError;

/// The kind of external system a peer points at.
///
/// The numeric discriminants match the values stored in the catalog `peers.type`
/// column, so they must never be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum PeerKind {
    Postgres = 1,
    MySql = 2,
    Mongo = 3,
    ClickHouse = 4,
    Snowflake = 5,
    BigQuery = 6,
    Kafka = 7,
    PubSub = 8,
    EventHubs = 9,
    S3 = 10,
    Elasticsearch = 11,
}

impl PeerKind {
    /// Returns `true` if this kind of peer can act as a CDC/QRep source.
    pub fn is_source(&self) -> bool {
        matches!(self, PeerKind::Postgres | PeerKind::MySql | PeerKind::Mongo)
    }

    /// Returns `true` if this kind of peer maintains normalized tables, as
    /// opposed to append-only sinks such as queues and object stores.
    pub fn is_normalizing(&self) -> bool {
        matches!(
            self,
            PeerKind::ClickHouse | PeerKind::Snowflake | PeerKind::BigQuery
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Postgres => "postgres",
            PeerKind::MySql => "mysql",
            PeerKind::Mongo => "mongo",
            PeerKind::ClickHouse => "clickhouse",
            PeerKind::Snowflake => "snowflake",
            PeerKind::BigQuery => "bigquery",
            PeerKind::Kafka => "kafka",
            PeerKind::PubSub => "pubsub",
            PeerKind::EventHubs => "eventhubs",
            PeerKind::S3 => "s3",
            PeerKind::Elasticsearch => "elasticsearch",
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for a Postgres peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Require TLS for the connection.
    #[serde(default)]
    pub tls_enabled: bool,
    /// PEM bundle of trusted root certificates for TLS connections.
    #[serde(default)]
    pub trusted_root_certs: String,
}

/// Connection settings for a MySQL or MariaDB peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MySqlConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Replication mechanism: `true` streams by GTID, `false` by file position.
    #[serde(default = "default_true")]
    pub use_gtid: bool,
}

/// Connection settings for a MongoDB replica set peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MongoConfig {
    /// Full connection URI, including credentials and replica set options.
    pub uri: String,
    pub database: String,
}

/// Connection settings for a ClickHouse peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClickHouseConfig {
    /// HTTP(S) endpoint, e.g. `https://host:8443`.
    pub url: String,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Object-store bucket used for staging Avro files during sync.
    #[serde(default)]
    pub staging_bucket: Option<String>,
}

/// Connection settings for a Snowflake peer using key-pair JWT auth.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SnowflakeConfig {
    pub account_id: String,
    pub username: String,
    /// PKCS#8 PEM-encoded RSA private key.
    pub private_key: String,
    /// SHA-256 fingerprint of the registered public key, as shown by
    /// `DESCRIBE USER` (`SHA256:...`).
    pub public_key_fingerprint: String,
    pub database: String,
    pub warehouse: String,
    /// S3 bucket backing the external stage used for Avro batch loads. When
    /// absent, batches land through multi-row inserts instead of `COPY INTO`.
    #[serde(default)]
    pub staging_bucket: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Schema holding the raw table and stages. Defaults to `_PEERDB_INTERNAL`.
    #[serde(default)]
    pub metadata_schema: Option<String>,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

/// Connection settings for a BigQuery peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset_id: String,
    /// Service-account key JSON.
    pub service_account_key: String,
}

/// Connection settings for a Kafka peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KafkaConfig {
    pub servers: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub sasl_mechanism: Option<String>,
    #[serde(default)]
    pub disable_tls: bool,
}

/// Connection settings for a Google Pub/Sub peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PubSubConfig {
    pub project_id: String,
    pub service_account_key: String,
}

/// Connection settings for an Azure Event Hubs namespace group.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EventHubsConfig {
    pub namespace: String,
    pub resource_group: String,
    pub location: String,
    #[serde(default)]
    pub partition_count: u32,
}

/// Connection settings for an S3-compatible object store peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct S3Config {
    /// Target URL in the form `s3://bucket/prefix`.
    pub url: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Connection settings for an Elasticsearch peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ElasticsearchConfig {
    pub addresses: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Typed configuration blob for one peer.
///
/// Serialized form is internally tagged so that the catalog stores a single
/// self-describing JSON document per peer. Encrypting that document at rest
/// is the job of the secret store wrapping the catalog, not of this type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerConfig {
    Postgres(PostgresConfig),
    MySql(MySqlConfig),
    Mongo(MongoConfig),
    ClickHouse(ClickHouseConfig),
    Snowflake(SnowflakeConfig),
    BigQuery(BigQueryConfig),
    Kafka(KafkaConfig),
    PubSub(PubSubConfig),
    EventHubs(EventHubsConfig),
    S3(S3Config),
    Elasticsearch(ElasticsearchConfig),
}

impl PeerConfig {
    /// Returns the peer kind of this configuration.
    pub fn kind(&self) -> PeerKind {
        match self {
            PeerConfig::Postgres(_) => PeerKind::Postgres,
            PeerConfig::MySql(_) => PeerKind::MySql,
            PeerConfig::Mongo(_) => PeerKind::Mongo,
            PeerConfig::ClickHouse(_) => PeerKind::ClickHouse,
            PeerConfig::Snowflake(_) => PeerKind::Snowflake,
            PeerConfig::BigQuery(_) => PeerKind::BigQuery,
            PeerConfig::Kafka(_) => PeerKind::Kafka,
            PeerConfig::PubSub(_) => PeerKind::PubSub,
            PeerConfig::EventHubs(_) => PeerKind::EventHubs,
            PeerConfig::S3(_) => PeerKind::S3,
            PeerConfig::Elasticsearch(_) => PeerKind::Elasticsearch,
        }
    }
}

/// A named peer together with its typed configuration.
#[derive(Clone, Debug)]
pub struct Peer {
    pub name: String,
    pub config: PeerConfig,
}

impl Peer {
    pub fn new(name: impl Into<String>, config: PeerConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn kind(&self) -> PeerKind {
        self.config.kind()
    }

    /// Validates fields all peer kinds must carry.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::MissingField {
                field: "name".to_string(),
            });
        }

        match &self.config {
            PeerConfig::Postgres(c) if c.host.is_empty() => {
                Err(ValidationError::invalid("host", "must not be empty"))
            }
            PeerConfig::MySql(c) if c.host.is_empty() => {
                Err(ValidationError::invalid("host", "must not be empty"))
            }
            PeerConfig::Mongo(c) if c.uri.is_empty() => {
                Err(ValidationError::invalid("uri", "must not be empty"))
            }
            PeerConfig::S3(c) if !c.url.starts_with("s3://") => {
                Err(ValidationError::invalid("url", "must start with s3://"))
            }
            _ => Ok(()),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_query_timeout_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_config_roundtrips_through_tagged_json() {
        let json = r#"{
            "kind": "postgres",
            "host": "db.example.com",
            "port": 5432,
            "database": "app",
            "username": "replicator"
        }"#;
        let config: PeerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), PeerKind::Postgres);
        assert!(config.kind().is_source());
    }

    #[test]
    fn s3_url_is_validated() {
        let peer = Peer::new(
            "lake",
            PeerConfig::S3(S3Config {
                url: "gs://not-s3".to_string(),
                access_key_id: None,
                secret_access_key: None,
                region: None,
                endpoint: None,
            }),
        );
        assert!(peer.validate().is_err());
    }

    #[test]
    fn normalizing_kinds_are_warehouses_only() {
        assert!(PeerKind::Snowflake.is_normalizing());
        assert!(PeerKind::ClickHouse.is_normalizing());
        assert!(!PeerKind::Kafka.is_normalizing());
        assert!(!PeerKind::S3.is_normalizing());
    }
}
