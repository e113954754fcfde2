//! MongoDB source: replica-set change streams.
//!
//! Documents map onto a fixed two-column schema: `_id` (the stringified
//! document key, also the primary key) and `doc` (the full document as
//! JSON). The checkpoint id is derived from the event's cluster time and the
//! checkpoint text carries the resume token, which is what actually restarts
//! the stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::change_stream::ChangeStream;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::FullDocumentType;
use mongodb::Client;
use sluice_config::{MongoConfig, TableMapping};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::buffer::{BufferKey, ChangeBuffer};
use crate::error::{ErrorKind, SluiceResult};
use crate::qrep::{Partition, PartitionValue};
use crate::source::{
    CdcPull, GetTableSchema, GetVersion, PullOutcome, PullRequest, QRepPull, ReplicationSetup,
    ValidateSource, WatermarkStats,
};
use crate::types::{
    ChangeMeta, ChangeRecord, Checkpoint, ColumnSchema, RecordItems, TableSchema, Value, ValueKind,
};
use crate::{bail, sluice_error};

/// Column carrying the stringified document key.
const ID_COLUMN: &str = "_id";
/// Column carrying the full document as JSON.
const DOC_COLUMN: &str = "doc";

/// Fixed per-collection schema for document sources.
pub fn collection_schema(destination_identifier: &str) -> TableSchema {
    TableSchema::new(
        destination_identifier,
        vec![
            ColumnSchema::new(ID_COLUMN, ValueKind::String, -1, false),
            ColumnSchema::new(DOC_COLUMN, ValueKind::Json, -1, true),
        ],
        vec![ID_COLUMN.to_string()],
    )
}

/// MongoDB CDC and QRep source.
pub struct MongoSource {
    mirror_name: String,
    config: MongoConfig,
    mappings: HashMap<String, String>,
    client: Client,
    stream: Mutex<Option<ChangeStream<ChangeStreamEvent<Document>>>>,
    pulling: AtomicBool,
    resume_token: Mutex<Option<ResumeToken>>,
}

impl MongoSource {
    pub async fn connect(
        mirror_name: impl Into<String>,
        config: MongoConfig,
        table_mappings: &[TableMapping],
    ) -> SluiceResult<Self> {
        let mirror_name = mirror_name.into();
        let client = Client::with_uri_str(&config.uri).await?;

        let mappings = table_mappings
            .iter()
            .map(|m| {
                (
                    m.source_identifier.clone(),
                    m.destination_identifier.clone(),
                )
            })
            .collect();

        info!(mirror = %mirror_name, database = %config.database, "connected mongo source");

        Ok(Self {
            mirror_name,
            config,
            mappings,
            client,
            stream: Mutex::new(None),
            pulling: AtomicBool::new(false),
            resume_token: Mutex::new(None),
        })
    }

    async fn open_stream(
        &self,
        resume_after: Option<ResumeToken>,
    ) -> SluiceResult<ChangeStream<ChangeStreamEvent<Document>>> {
        let database = self.client.database(&self.config.database);

        let mut watch = database
            .watch()
            .full_document(FullDocumentType::UpdateLookup);
        if let Some(token) = resume_after {
            watch = watch.resume_after(token);
        }

        Ok(watch.await?)
    }

    fn record_for_event(
        &self,
        event: &ChangeStreamEvent<Document>,
        checkpoint: Checkpoint,
    ) -> SluiceResult<Option<(BufferKey, ChangeRecord)>> {
        let Some(ns) = &event.ns else {
            return Ok(None);
        };
        let Some(collection) = &ns.coll else {
            return Ok(None);
        };
        let Some(destination_table) = self.mappings.get(collection.as_str()).cloned() else {
            return Ok(None);
        };

        let commit_time = event
            .cluster_time
            .map(|ts| {
                DateTime::from_timestamp(ts.time as i64, 0).unwrap_or_else(Utc::now)
            })
            .unwrap_or_else(Utc::now);

        let meta = ChangeMeta {
            checkpoint,
            commit_time,
            source_table: collection.to_string(),
            destination_table: destination_table.clone(),
        };

        let schema = collection_schema(&destination_table);
        let document_id = event
            .document_key
            .as_ref()
            .and_then(|key| key.get("_id"))
            .map(bson_id_string);
        let Some(document_id) = document_id else {
            warn!(collection = %collection, "change event without a document key, skipping");
            return Ok(None);
        };

        let record = match event.operation_type {
            OperationType::Insert | OperationType::Replace | OperationType::Update => {
                let Some(full_document) = &event.full_document else {
                    // The post-image can be gone when the document was deleted
                    // before the update-lookup ran; the delete follows.
                    return Ok(None);
                };

                let mut items = RecordItems::new();
                items.insert(ID_COLUMN, Value::String(document_id));
                items.insert(DOC_COLUMN, Value::Json(document_to_json(full_document)?));

                if event.operation_type == OperationType::Insert {
                    ChangeRecord::Insert {
                        meta,
                        items,
                    }
                } else {
                    ChangeRecord::Update {
                        meta,
                        items,
                        old_items: None,
                        unchanged_toast_columns: Default::default(),
                    }
                }
            }
            OperationType::Delete => {
                let mut old_items = RecordItems::new();
                old_items.insert(ID_COLUMN, Value::String(document_id));
                ChangeRecord::Delete { meta, old_items }
            }
            _ => return Ok(None),
        };

        let key = match record.items() {
            Some(items) => BufferKey::from_items(&schema, items),
            None => BufferKey::unkeyed(&schema.name),
        };

        Ok(Some((key, record)))
    }
}

impl CdcPull for MongoSource {
    async fn setup_replication(
        &self,
        _start_offset: &Checkpoint,
    ) -> SluiceResult<ReplicationSetup> {
        // Opening the stream validates the deployment is a replica set and
        // yields the first resume token.
        let stream = self.open_stream(None).await?;
        let token = stream.resume_token();
        *self.stream.lock().await = Some(stream);

        let initial_offset = token
            .as_ref()
            .map(resume_token_checkpoint)
            .transpose()?
            .unwrap_or_default();
        *self.resume_token.lock().await = token;

        Ok(ReplicationSetup {
            slot_name: format!("change_stream_{}", self.mirror_name),
            snapshot_name: None,
            supports_tid_scans: false,
            initial_offset,
        })
    }

    async fn pull(&self, request: PullRequest, buffer: &mut ChangeBuffer) -> SluiceResult<PullOutcome> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let token = self.resume_token.lock().await.clone();
            *guard = Some(self.open_stream(token).await?);
        }
        let stream = guard.as_mut().ok_or_else(|| {
            sluice_error!(ErrorKind::ReplicationStreamFailed, "Stream state missing")
        })?;

        self.pulling.store(true, Ordering::Release);
        let result = pull_inner(self, stream, request, buffer).await;
        self.pulling.store(false, Ordering::Release);

        if result.is_ok() {
            *self.resume_token.lock().await = stream.resume_token();
        }

        result
    }

    async fn keepalive(&self) -> SluiceResult<()> {
        if self.pulling.load(Ordering::Acquire) {
            return Ok(());
        }

        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;

        Ok(())
    }

    async fn ack(&self, _offset: &Checkpoint) -> SluiceResult<()> {
        // Change streams retain history by oplog size; the resume token we
        // already hold is the acknowledgement.
        Ok(())
    }

    async fn cleanup(&self, _mirror_name: &str) -> SluiceResult<()> {
        self.stream.lock().await.take();
        *self.resume_token.lock().await = None;
        Ok(())
    }
}

async fn pull_inner(
    source: &MongoSource,
    stream: &mut ChangeStream<ChangeStreamEvent<Document>>,
    request: PullRequest,
    buffer: &mut ChangeBuffer,
) -> SluiceResult<PullOutcome> {
    let mut outcome = PullOutcome::default();
    let mut accepted = 0usize;

    loop {
        if accepted >= request.batch_limit {
            break;
        }

        let next = tokio::time::timeout(request.idle_timeout, stream.next()).await;
        let event = match next {
            Err(_) => break,
            Ok(None) => return Err(sluice_error!(ErrorKind::Eof, "Change stream ended")),
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(Some(Ok(event))) => event,
        };

        let checkpoint = match stream.resume_token() {
            Some(token) => resume_token_checkpoint(&token)?,
            None => Checkpoint::default(),
        };

        if let Some((key, record)) = source.record_for_event(&event, checkpoint.clone())? {
            buffer.set(key, record)?;
            accepted += 1;
        }
        outcome.offset_reached = checkpoint;
    }

    outcome.records = accepted;

    Ok(outcome)
}

impl GetTableSchema for MongoSource {
    async fn table_schema(
        &self,
        _source_identifier: &str,
        destination_identifier: &str,
        _excluded_columns: &[String],
    ) -> SluiceResult<TableSchema> {
        Ok(collection_schema(destination_identifier))
    }
}

impl QRepPull for MongoSource {
    async fn watermark_stats(
        &self,
        collection: &str,
        _watermark_column: &str,
        _last_end: Option<&PartitionValue>,
    ) -> SluiceResult<Option<WatermarkStats>> {
        let coll = self
            .client
            .database(&self.config.database)
            .collection::<Document>(collection);

        let row_count = coll.estimated_document_count().await?;
        if row_count == 0 {
            return Ok(None);
        }

        let first = coll
            .find_one(doc! {})
            .sort(doc! { "_id": 1 })
            .await?
            .and_then(|d| d.get("_id").map(bson_id_string));
        let last = coll
            .find_one(doc! {})
            .sort(doc! { "_id": -1 })
            .await?
            .and_then(|d| d.get("_id").map(bson_id_string));

        let (Some(first), Some(last)) = (first, last) else {
            return Ok(None);
        };

        Ok(Some(WatermarkStats {
            min: PartitionValue::ObjectId(first),
            max: PartitionValue::ObjectId(last),
            row_count,
        }))
    }

    async fn pull_partition(
        &self,
        collection: &str,
        _watermark_column: &str,
        partition: &Partition,
    ) -> SluiceResult<Vec<RecordItems>> {
        let (PartitionValue::ObjectId(start), PartitionValue::ObjectId(end)) =
            (&partition.start, &partition.end)
        else {
            bail!(
                ErrorKind::UnsupportedDataType,
                "Mongo partitions use object-id watermarks"
            );
        };

        let start_id = mongodb::bson::oid::ObjectId::parse_str(start).map_err(|err| {
            sluice_error!(
                ErrorKind::ValidationError,
                "Invalid object id bound",
                err.to_string()
            )
        })?;
        let end_id = mongodb::bson::oid::ObjectId::parse_str(end).map_err(|err| {
            sluice_error!(
                ErrorKind::ValidationError,
                "Invalid object id bound",
                err.to_string()
            )
        })?;

        let coll = self
            .client
            .database(&self.config.database)
            .collection::<Document>(collection);
        let mut cursor = coll
            .find(doc! { "_id": { "$gte": start_id, "$lte": end_id } })
            .await?;

        let mut rows = Vec::new();
        while let Some(document) = cursor.next().await {
            let document = document?;
            let id = document
                .get("_id")
                .map(bson_id_string)
                .unwrap_or_default();

            let mut items = RecordItems::new();
            items.insert(ID_COLUMN, Value::String(id));
            items.insert(DOC_COLUMN, Value::Json(document_to_json(&document)?));
            rows.push(items);
        }

        Ok(rows)
    }
}

impl ValidateSource for MongoSource {
    async fn validate_mirror_source(&self, table_identifiers: &[String]) -> SluiceResult<()> {
        // Change streams need a replica set; hello reports the set name.
        let hello = self
            .client
            .database("admin")
            .run_command(doc! { "hello": 1 })
            .await?;
        if hello.get("setName").is_none() {
            bail!(
                ErrorKind::ValidationError,
                "Change streams require a replica set deployment"
            );
        }

        let database = self.client.database(&self.config.database);
        let existing = database.list_collection_names().await?;
        for identifier in table_identifiers {
            if !existing.iter().any(|name| name == identifier) {
                bail!(
                    ErrorKind::ValidationError,
                    "Source collection not found",
                    identifier.clone()
                );
            }
        }

        Ok(())
    }
}

impl GetVersion for MongoSource {
    async fn version(&self) -> SluiceResult<String> {
        let info = self
            .client
            .database("admin")
            .run_command(doc! { "buildInfo": 1 })
            .await?;

        info.get_str("version")
            .map(str::to_string)
            .map_err(|err| {
                sluice_error!(
                    ErrorKind::QueryFailed,
                    "buildInfo returned no version",
                    err.to_string()
                )
            })
    }
}

/// Derives a comparable checkpoint from a resume token.
///
/// The token's hex data begins with the cluster timestamp, so its prefix
/// orders consistently with the stream; the full token rides in the text.
fn resume_token_checkpoint(token: &ResumeToken) -> SluiceResult<Checkpoint> {
    let bson = mongodb::bson::to_bson(token)?;

    let hex = match &bson {
        Bson::Document(doc) => doc.get_str("_data").unwrap_or_default().to_string(),
        _ => String::new(),
    };

    // The first 18 hex chars after the type marker encode seconds and
    // increment of the cluster time.
    let id = u64::from_str_radix(hex.get(2..18).unwrap_or("0"), 16).unwrap_or(0);

    Ok(Checkpoint::with_text(id, hex))
}

fn bson_id_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn document_to_json(document: &Document) -> SluiceResult<serde_json::Value> {
    serde_json::to_value(document).map_err(Into::into)
}

impl From<mongodb::bson::ser::Error> for crate::error::SluiceError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        sluice_error!(
            ErrorKind::SerializationFailed,
            "BSON encoding failed",
            err.to_string()
        )
        .with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_schema_is_keyed_on_id() {
        let schema = collection_schema("users");
        assert_eq!(schema.primary_key_columns, vec![ID_COLUMN]);
        assert_eq!(schema.columns.len(), 2);
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn object_ids_render_as_hex() {
        let oid = mongodb::bson::oid::ObjectId::new();
        assert_eq!(bson_id_string(&Bson::ObjectId(oid)), oid.to_hex());
        assert_eq!(
            bson_id_string(&Bson::String("plain".to_string())),
            "plain"
        );
    }

    #[test]
    fn documents_serialize_to_json_items() {
        let document = doc! { "a": 1, "nested": { "b": [1, 2, 3] } };
        let json = document_to_json(&document).unwrap();
        assert_eq!(json["nested"]["b"][2], serde_json::json!(3));
    }
}
