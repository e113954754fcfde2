use std::collections::HashMap;

use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use sluice::destination::{CdcSync, QRepSync, ValidateDestination};
use sluice::error::{ErrorKind, SluiceError, SluiceResult};
use sluice::staging::{encode_raw_rows, staged_object_key};
use sluice::types::{RawRow, RecordItems, SchemaDelta, TableSchema};
use sluice_config::S3Config;
use tracing::{debug, info};

use crate::sluice_error_from_sdk;

/// Uploads staged batch objects; shared by the warehouse connectors.
#[derive(Clone)]
pub struct S3StagingClient {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3StagingClient {
    /// Builds a client from the ambient AWS environment plus optional
    /// overrides from the peer config.
    pub async fn connect(bucket: impl Into<String>, config: &S3Config) -> SluiceResult<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "sluice-peer-config",
            ));
        }

        let mut sdk_config = loader.load().await;
        if let Some(endpoint) = &config.endpoint {
            sdk_config = sdk_config
                .into_builder()
                .endpoint_url(endpoint.clone())
                .build();
        }

        Ok(Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket: bucket.into(),
            prefix: String::new(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix.trim_end_matches('/'))
        }
    }

    /// Uploads one object, returning its `s3://` URL.
    pub async fn put_object(&self, key: &str, bytes: Vec<u8>) -> SluiceResult<String> {
        let key = self.full_key(key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| sluice_error_from_sdk("PutObject", err))?;

        debug!(bucket = %self.bucket, key = %key, "staged object uploaded");

        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    /// Deletes every object below `prefix`, used by mirror teardown.
    pub async fn delete_prefix(&self, prefix: &str) -> SluiceResult<()> {
        let prefix = self.full_key(prefix);

        let mut continuation: Option<String> = None;
        loop {
            let listed = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|err| sluice_error_from_sdk("ListObjectsV2", err))?;

            for object in listed.contents() {
                if let Some(key) = object.key() {
                    self.client
                        .delete_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|err| sluice_error_from_sdk("DeleteObject", err))?;
                }
            }

            match listed.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => return Ok(()),
            }
        }
    }
}

/// Append-only Avro sink: every sync batch becomes one object per table.
///
/// There is no normalized state to merge into, so this peer implements only
/// the sync-side capabilities.
#[derive(Clone)]
pub struct S3Destination {
    staging: S3StagingClient,
}

impl S3Destination {
    /// Parses `s3://bucket/prefix` from the peer config and connects.
    pub async fn connect(config: &S3Config) -> SluiceResult<Self> {
        let trimmed = config.url.strip_prefix("s3://").ok_or_else(|| {
            SluiceError::from((
                ErrorKind::ConfigError,
                "S3 url must start with s3://",
                config.url.clone(),
            ))
        })?;
        let (bucket, prefix) = trimmed.split_once('/').unwrap_or((trimmed, ""));

        let staging = S3StagingClient::connect(bucket, config)
            .await?
            .with_prefix(prefix);

        Ok(Self { staging })
    }

    pub fn from_staging(staging: S3StagingClient) -> Self {
        Self { staging }
    }
}

impl CdcSync for S3Destination {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn setup_raw_table(&self, _mirror_name: &str) -> SluiceResult<()> {
        // Objects are created per batch; there is nothing to pre-create.
        Ok(())
    }

    async fn sync_batch(
        &self,
        mirror_name: &str,
        batch_id: i64,
        rows: Vec<RawRow>,
    ) -> SluiceResult<()> {
        // Group per destination table so each object holds one table's rows.
        let mut by_table: HashMap<&str, Vec<&RawRow>> = HashMap::new();
        for row in &rows {
            by_table
                .entry(row.destination_table_name.as_str())
                .or_default()
                .push(row);
        }

        for (table, table_rows) in by_table {
            let owned: Vec<RawRow> = table_rows.into_iter().cloned().collect();
            let bytes = encode_raw_rows(&owned)?;
            let key = staged_object_key(mirror_name, batch_id, table);
            self.staging.put_object(&key, bytes).await?;
        }

        info!(mirror = mirror_name, batch_id, rows = rows.len(), "batch written to s3");

        Ok(())
    }

    async fn replay_schema_deltas(
        &self,
        _mirror_name: &str,
        _deltas: &[SchemaDelta],
    ) -> SluiceResult<()> {
        // Avro objects are self-describing; nothing to alter.
        Ok(())
    }

    async fn remove_table_entries(
        &self,
        _mirror_name: &str,
        _destination_tables: &[String],
        _normalize_batch_id: i64,
        _sync_batch_id: i64,
    ) -> SluiceResult<()> {
        // Landed objects are immutable history for downstream consumers.
        Ok(())
    }

    async fn drop_mirror_state(&self, mirror_name: &str) -> SluiceResult<()> {
        self.staging.delete_prefix(mirror_name).await
    }
}

impl QRepSync for S3Destination {
    async fn truncate_destination(&self, destination_table: &str) -> SluiceResult<()> {
        self.staging.delete_prefix(destination_table).await
    }

    async fn sync_partition(
        &self,
        mirror_name: &str,
        destination_table: &str,
        partition_id: &str,
        _schema: &TableSchema,
        rows: Vec<RecordItems>,
        _upsert: bool,
    ) -> SluiceResult<u64> {
        // Partition rows ride the raw-row container with the payload in
        // `_peerdb_data`, which keeps one Avro schema for every object.
        let raw_rows: Vec<RawRow> = rows
            .iter()
            .enumerate()
            .map(|(position, items)| RawRow {
                uid: format!("{partition_id}-{position:012x}"),
                timestamp: 0,
                destination_table_name: destination_table.to_string(),
                data: items.to_json().to_string(),
                record_type: 0,
                match_data: String::new(),
                batch_id: 0,
                unchanged_toast_columns: String::new(),
            })
            .collect();

        let bytes = encode_raw_rows(&raw_rows)?;
        let key = format!("{mirror_name}/qrep/{destination_table}/{partition_id}.avro");
        self.staging.put_object(&key, bytes).await?;

        Ok(raw_rows.len() as u64)
    }
}

impl ValidateDestination for S3Destination {
    async fn validate_mirror_destination(
        &self,
        _table_schemas: &HashMap<String, TableSchema>,
    ) -> SluiceResult<()> {
        // A probe object proves write permission on the target prefix.
        let key = format!("_sluice_validate/{}", uuid::Uuid::new_v4());
        self.staging.put_object(&key, b"ok".to_vec()).await?;
        self.staging.delete_prefix("_sluice_validate").await
    }
}
