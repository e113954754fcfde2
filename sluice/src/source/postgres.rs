//! Postgres source: logical replication over pgoutput.
//!
//! The puller owns a replication-mode connection for the stream and a regular
//! connection for schema discovery and bulk reads. Records are tagged with
//! the commit LSN of their transaction (taken from the BEGIN message's final
//! LSN), so a transaction interrupted by a batch boundary resumes with the
//! same checkpoint in the next batch.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use pg_escape::{quote_identifier, quote_literal};
use postgres_replication::LogicalReplicationStream;
use postgres_replication::protocol::{self, LogicalReplicationMessage, ReplicationMessage};
use rust_decimal::Decimal;
use rustls::ClientConfig;
use rustls::pki_types::{CertificateDer, pem::PemObject};
use sluice_config::{PostgresConfig, TableMapping};
use tokio::sync::Mutex;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::types::{PgLsn, Type};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use crate::buffer::{BufferKey, ChangeBuffer};
use crate::error::{ErrorKind, SluiceError, SluiceResult};
use crate::qrep::{Partition, PartitionValue};
use crate::schema_tracker::SchemaTracker;
use crate::source::{
    CdcPull, GetTableSchema, GetVersion, IdleDeadline, PullOutcome, PullRequest, QRepPull,
    ReplicationSetup, ValidateSource, WatermarkStats,
};
use crate::types::{
    ChangeMeta, ChangeRecord, Checkpoint, ColumnSchema, RecordItems, SchemaDelta, TableSchema,
    Value, ValueKind,
};
use crate::{bail, sluice_error};

/// Microseconds between the Unix and Postgres (2000-01-01) epochs.
const POSTGRES_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

fn slot_name(mirror_name: &str) -> String {
    format!("sluice_slot_{}", sanitize(mirror_name))
}

fn publication_name(mirror_name: &str) -> String {
    format!("sluice_pub_{}", sanitize(mirror_name))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Cached shape of one relation from the stream's Relation messages.
struct RelationState {
    source_identifier: String,
    destination_identifier: String,
    schema: TableSchema,
}

/// Mutable streaming state, held behind a lock so keepalives can probe it.
struct PullState {
    stream: Pin<Box<LogicalReplicationStream>>,
    /// Commit LSN of the transaction currently streaming, from BEGIN.
    current_commit_lsn: Option<PgLsn>,
    /// Commit time of the transaction currently streaming.
    current_commit_time: DateTime<Utc>,
    /// Last fully received commit LSN.
    last_commit_lsn: u64,
    /// Relations announced by the stream, by relation id.
    relations: HashMap<u32, RelationState>,
}

/// Postgres CDC and QRep source.
pub struct PostgresSource {
    mirror_name: String,
    config: PostgresConfig,
    /// Source identifier to destination identifier.
    mappings: HashMap<String, String>,
    replication_client: Arc<Client>,
    query_client: Arc<Client>,
    tracker: Mutex<SchemaTracker>,
    state: Mutex<Option<PullState>>,
    /// True while a pull is actively receiving; keepalives become no-ops.
    pulling: AtomicBool,
    /// Offset acknowledged as durable, reported in standby status updates.
    flush_lsn: AtomicU64,
}

impl PostgresSource {
    /// Connects both the replication-mode and the regular client.
    pub async fn connect(
        mirror_name: impl Into<String>,
        config: PostgresConfig,
        table_mappings: &[TableMapping],
    ) -> SluiceResult<Self> {
        let mirror_name = mirror_name.into();

        let replication_client = connect_client(&config, Some(ReplicationMode::Logical)).await?;
        let query_client = connect_client(&config, None).await?;

        let mappings: HashMap<String, String> = table_mappings
            .iter()
            .map(|m| {
                (
                    m.source_identifier.clone(),
                    m.destination_identifier.clone(),
                )
            })
            .collect();

        info!(mirror = %mirror_name, host = %config.host, "connected postgres source");

        Ok(Self {
            tracker: Mutex::new(SchemaTracker::new(mirror_name.clone(), HashMap::new())),
            mirror_name,
            config,
            mappings,
            replication_client,
            query_client,
            state: Mutex::new(None),
            pulling: AtomicBool::new(false),
            flush_lsn: AtomicU64::new(0),
        })
    }

    /// Seeds the schema tracker, usually from catalog snapshots on resume.
    pub async fn seed_schemas(&self, schemas: HashMap<String, TableSchema>) {
        let mut tracker = self.tracker.lock().await;
        *tracker = SchemaTracker::new(self.mirror_name.clone(), schemas);
    }

    async fn ensure_publication(&self) -> SluiceResult<()> {
        let publication = publication_name(&self.mirror_name);

        let exists_query = format!(
            "SELECT 1 FROM pg_publication WHERE pubname = {}",
            quote_literal(&publication)
        );
        let exists = self
            .query_client
            .simple_query(&exists_query)
            .await?
            .iter()
            .any(|msg| matches!(msg, SimpleQueryMessage::Row(_)));
        if exists {
            return Ok(());
        }

        let tables: Vec<String> = self
            .mappings
            .keys()
            .map(|source| quote_qualified(source))
            .collect();
        let create = format!(
            "CREATE PUBLICATION {} FOR TABLE {}",
            quote_identifier(&publication),
            tables.join(", ")
        );
        self.query_client.simple_query(&create).await?;

        info!(publication = %publication, "created publication");

        Ok(())
    }

    /// Creates the replication slot, exporting a snapshot for the initial
    /// copy, or reuses an existing slot's confirmed position.
    async fn ensure_slot(&self) -> SluiceResult<(Checkpoint, Option<String>)> {
        let slot = slot_name(&self.mirror_name);

        let create = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput (SNAPSHOT 'export')",
            quote_identifier(&slot)
        );
        match self.replication_client.simple_query(&create).await {
            Ok(messages) => {
                for message in messages {
                    if let SimpleQueryMessage::Row(row) = message {
                        let consistent_point = row
                            .try_get("consistent_point")?
                            .ok_or_else(|| missing_column("consistent_point"))?;
                        let snapshot_name = row.try_get("snapshot_name")?.map(str::to_string);

                        let lsn: PgLsn = consistent_point.parse().map_err(|_| {
                            sluice_error!(
                                ErrorKind::ReplicationStreamFailed,
                                "Unparsable consistent point",
                                consistent_point.to_string()
                            )
                        })?;

                        info!(slot = %slot, lsn = %lsn, "created replication slot");

                        return Ok((Checkpoint::new(lsn.into()), snapshot_name));
                    }
                }

                bail!(
                    ErrorKind::ReplicationStreamFailed,
                    "CREATE_REPLICATION_SLOT returned no row"
                );
            }
            Err(err) if err.code().map(|c| c.code()) == Some("42710") => {
                // Slot already exists: resume from its confirmed position.
                let query = format!(
                    "SELECT confirmed_flush_lsn, wal_status FROM pg_replication_slots \
                     WHERE slot_name = {}",
                    quote_literal(&slot)
                );
                for message in self.query_client.simple_query(&query).await? {
                    let SimpleQueryMessage::Row(row) = message else {
                        continue;
                    };

                    if let Some(status) = row.try_get("wal_status")?
                        && (status == "lost" || status == "unreserved")
                    {
                        bail!(
                            ErrorKind::ReplicationSlotInvalid,
                            "Replication slot can no longer be read",
                            format!("slot '{slot}' has wal_status '{status}'")
                        );
                    }

                    let confirmed = row
                        .try_get("confirmed_flush_lsn")?
                        .ok_or_else(|| missing_column("confirmed_flush_lsn"))?;
                    let lsn: PgLsn = confirmed.parse().map_err(|_| {
                        sluice_error!(
                            ErrorKind::ReplicationStreamFailed,
                            "Unparsable confirmed_flush_lsn",
                            confirmed.to_string()
                        )
                    })?;

                    info!(slot = %slot, lsn = %lsn, "reusing replication slot");

                    return Ok((Checkpoint::new(lsn.into()), None));
                }

                bail!(
                    ErrorKind::ReplicationSlotInvalid,
                    "Replication slot exists but is not visible",
                    slot
                );
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn open_stream(&self, start: PgLsn) -> SluiceResult<PullState> {
        let slot = slot_name(&self.mirror_name);
        let publication = publication_name(&self.mirror_name);

        let options = format!(
            r#"("proto_version" '1', "publication_names" {})"#,
            quote_literal(&publication)
        );
        let query = format!(
            r#"START_REPLICATION SLOT {} LOGICAL {} {}"#,
            quote_identifier(&slot),
            start,
            options
        );

        let copy_stream = self
            .replication_client
            .copy_both_simple::<bytes::Bytes>(&query)
            .await?;
        let stream = LogicalReplicationStream::new(copy_stream);

        debug!(slot = %slot, start = %start, "replication stream opened");

        Ok(PullState {
            stream: Box::pin(stream),
            current_commit_lsn: None,
            current_commit_time: Utc::now(),
            last_commit_lsn: start.into(),
            relations: HashMap::new(),
        })
    }

    /// Sends a standby status update reporting `flush_lsn` as durable.
    async fn send_status_update(state: &mut PullState, flush_lsn: u64) -> SluiceResult<()> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64 - POSTGRES_EPOCH_OFFSET_MICROS)
            .unwrap_or_default();

        let lsn = PgLsn::from(flush_lsn);
        state
            .stream
            .as_mut()
            .standby_status_update(lsn, lsn, lsn, ts, 0)
            .await?;

        debug!(flush_lsn = %lsn, "standby status update sent");

        Ok(())
    }

    /// Converts one data message into buffered records and schema deltas.
    async fn handle_message(
        &self,
        state: &mut PullState,
        message: LogicalReplicationMessage,
        buffer: &mut ChangeBuffer,
        deltas: &mut Vec<SchemaDelta>,
    ) -> SluiceResult<usize> {
        match message {
            LogicalReplicationMessage::Begin(begin) => {
                state.current_commit_lsn = Some(PgLsn::from(begin.final_lsn()));
                state.current_commit_time = postgres_timestamp(begin.timestamp());
                Ok(0)
            }
            LogicalReplicationMessage::Commit(commit) => {
                state.last_commit_lsn = commit.commit_lsn();
                state.current_commit_lsn = None;
                Ok(0)
            }
            LogicalReplicationMessage::Relation(relation) => {
                self.handle_relation(state, &relation, deltas).await?;
                Ok(0)
            }
            LogicalReplicationMessage::Insert(insert) => {
                let Some(relation) = state.relations.get(&insert.rel_id()) else {
                    return Ok(0);
                };
                let items =
                    tuple_to_items(&relation.schema, insert.tuple().tuple_data(), None)?.items;
                let meta = record_meta(state, relation);
                let key = BufferKey::from_items(&relation.schema, &items);
                buffer.set(key, ChangeRecord::Insert { meta, items })?;
                Ok(1)
            }
            LogicalReplicationMessage::Update(update) => {
                let Some(relation) = state.relations.get(&update.rel_id()) else {
                    return Ok(0);
                };

                let old_items = update
                    .old_tuple()
                    .or(update.key_tuple())
                    .map(|tuple| tuple_to_items(&relation.schema, tuple.tuple_data(), None))
                    .transpose()?
                    .map(|converted| converted.items);

                let converted = tuple_to_items(
                    &relation.schema,
                    update.new_tuple().tuple_data(),
                    old_items.as_ref(),
                )?;

                let meta = record_meta(state, relation);
                let key = BufferKey::from_items(&relation.schema, &converted.items);
                buffer.set(
                    key,
                    ChangeRecord::Update {
                        meta,
                        items: converted.items,
                        old_items,
                        unchanged_toast_columns: converted.unchanged_toast_columns,
                    },
                )?;
                Ok(1)
            }
            LogicalReplicationMessage::Delete(delete) => {
                let Some(relation) = state.relations.get(&delete.rel_id()) else {
                    return Ok(0);
                };

                let Some(old_tuple) = delete.old_tuple().or(delete.key_tuple()) else {
                    warn!(
                        table = %relation.source_identifier,
                        "delete without replica identity, skipping"
                    );
                    return Ok(0);
                };

                let old_items =
                    tuple_to_items(&relation.schema, old_tuple.tuple_data(), None)?.items;
                let meta = record_meta(state, relation);
                let key = BufferKey::from_items(&relation.schema, &old_items);
                buffer.set(key, ChangeRecord::Delete { meta, old_items })?;
                Ok(1)
            }
            LogicalReplicationMessage::Truncate(_) => {
                // Truncate propagation is destination-specific and handled by
                // resync; the stream position still advances via commit.
                Ok(0)
            }
            LogicalReplicationMessage::Origin(_) | LogicalReplicationMessage::Type(_) => Ok(0),
            _ => Ok(0),
        }
    }

    async fn handle_relation(
        &self,
        state: &mut PullState,
        relation: &protocol::RelationBody,
        deltas: &mut Vec<SchemaDelta>,
    ) -> SluiceResult<()> {
        let namespace = relation.namespace().map_err(|err| {
            sluice_error!(
                ErrorKind::ReplicationStreamFailed,
                "Invalid relation namespace",
                err.to_string()
            )
        })?;
        let name = relation.name().map_err(|err| {
            sluice_error!(
                ErrorKind::ReplicationStreamFailed,
                "Invalid relation name",
                err.to_string()
            )
        })?;

        let source_identifier = format!("{namespace}.{name}");
        let Some(destination_identifier) = self.mappings.get(&source_identifier).cloned() else {
            // Not a mapped table; remember nothing.
            return Ok(());
        };

        let mut columns = Vec::with_capacity(relation.columns().len());
        let mut primary_key_columns = Vec::new();
        for column in relation.columns() {
            let column_name = column.name().map_err(|err| {
                sluice_error!(
                    ErrorKind::ReplicationStreamFailed,
                    "Invalid relation column name",
                    err.to_string()
                )
            })?;

            let kind = kind_from_oid(column.type_id() as u32);
            if column.flags() == 1 {
                primary_key_columns.push(column_name.to_string());
            }
            columns.push(ColumnSchema::new(column_name, kind, -1, true));
        }

        let mut schema = TableSchema::new(
            destination_identifier.clone(),
            columns,
            primary_key_columns,
        );
        // replident: 'd' default, 'f' full, 'i' index, 'n' nothing.
        schema.replica_identity_full =
            matches!(relation.replica_identity(), protocol::ReplicaIdentity::Full);

        let mut tracker = self.tracker.lock().await;
        if let Some(delta) =
            tracker.observe_relation(&source_identifier, &destination_identifier, &schema)?
        {
            deltas.push(delta);
        }
        drop(tracker);

        state.relations.insert(
            relation.rel_id(),
            RelationState {
                source_identifier,
                destination_identifier,
                schema,
            },
        );

        Ok(())
    }
}

fn record_meta(state: &PullState, relation: &RelationState) -> ChangeMeta {
    let commit_lsn: u64 = state
        .current_commit_lsn
        .map(Into::into)
        .unwrap_or(state.last_commit_lsn);

    ChangeMeta {
        checkpoint: Checkpoint::new(commit_lsn),
        commit_time: state.current_commit_time,
        source_table: relation.source_identifier.clone(),
        destination_table: relation.destination_identifier.clone(),
    }
}

impl CdcPull for PostgresSource {
    async fn setup_replication(
        &self,
        _start_offset: &Checkpoint,
    ) -> SluiceResult<ReplicationSetup> {
        self.ensure_publication().await?;
        let (initial_offset, snapshot_name) = self.ensure_slot().await?;

        Ok(ReplicationSetup {
            slot_name: slot_name(&self.mirror_name),
            snapshot_name,
            supports_tid_scans: true,
            initial_offset,
        })
    }

    async fn pull(&self, request: PullRequest, buffer: &mut ChangeBuffer) -> SluiceResult<PullOutcome> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            let start = PgLsn::from(self.flush_lsn.load(Ordering::Acquire));
            *guard = Some(self.open_stream(start).await?);
        }
        let state = guard.as_mut().ok_or_else(|| {
            sluice_error!(ErrorKind::ReplicationStreamFailed, "Stream state missing")
        })?;

        self.pulling.store(true, Ordering::Release);
        let result = self.pull_inner(state, request, buffer).await;
        self.pulling.store(false, Ordering::Release);

        result
    }

    async fn keepalive(&self) -> SluiceResult<()> {
        if self.pulling.load(Ordering::Acquire) {
            return Ok(());
        }

        // A held lock means a pull raced us; skip the ping.
        let Ok(mut guard) = self.state.try_lock() else {
            return Ok(());
        };
        if let Some(state) = guard.as_mut() {
            Self::send_status_update(state, self.flush_lsn.load(Ordering::Acquire)).await?;
        }

        Ok(())
    }

    async fn ack(&self, offset: &Checkpoint) -> SluiceResult<()> {
        self.flush_lsn.fetch_max(offset.id, Ordering::AcqRel);

        // Best effort immediate report; otherwise the next keepalive or
        // stream keepalive reply carries it.
        if let Ok(mut guard) = self.state.try_lock()
            && let Some(state) = guard.as_mut()
        {
            Self::send_status_update(state, self.flush_lsn.load(Ordering::Acquire)).await?;
        }

        Ok(())
    }

    async fn cleanup(&self, mirror_name: &str) -> SluiceResult<()> {
        let slot = slot_name(mirror_name);
        let publication = publication_name(mirror_name);

        // The stream must be closed before the slot can be dropped.
        self.state.lock().await.take();

        let drop_slot = format!(
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots \
             WHERE slot_name = {}",
            quote_literal(&slot)
        );
        self.query_client.simple_query(&drop_slot).await?;

        let drop_publication = format!(
            "DROP PUBLICATION IF EXISTS {}",
            quote_identifier(&publication)
        );
        self.query_client.simple_query(&drop_publication).await?;

        info!(slot = %slot, publication = %publication, "postgres replication state dropped");

        Ok(())
    }
}

impl PostgresSource {
    async fn pull_inner(
        &self,
        state: &mut PullState,
        request: PullRequest,
        buffer: &mut ChangeBuffer,
    ) -> SluiceResult<PullOutcome> {
        let mut outcome = PullOutcome::default();
        let mut accepted = 0usize;

        // The idle window re-arms only on accepted records. Walsenders send
        // keepalives on their own schedule, and begin/commit/relation
        // messages flow even without row traffic; none of that may postpone
        // the idle flush.
        let mut idle = IdleDeadline::start(request.idle_timeout);

        loop {
            if accepted >= request.batch_limit {
                break;
            }

            let next = tokio::time::timeout_at(idle.deadline(), state.stream.next()).await;

            let message = match next {
                // Idle timeout: the batch is whatever we have.
                Err(_) => break,
                Ok(None) => {
                    return Err(sluice_error!(
                        ErrorKind::Eof,
                        "Replication stream ended"
                    ));
                }
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                ReplicationMessage::XLogData(body) => {
                    let added = self
                        .handle_message(state, body.into_data(), buffer, &mut outcome.schema_deltas)
                        .await?;
                    if added > 0 {
                        idle.record_accepted();
                    }
                    accepted += added;
                }
                ReplicationMessage::PrimaryKeepAlive(keepalive) => {
                    if keepalive.reply() == 1 {
                        Self::send_status_update(state, self.flush_lsn.load(Ordering::Acquire))
                            .await?;
                    }
                }
                _ => {}
            }
        }

        outcome.offset_reached = Checkpoint::new(state.last_commit_lsn);
        outcome.records = accepted;

        Ok(outcome)
    }
}

impl GetTableSchema for PostgresSource {
    async fn table_schema(
        &self,
        source_identifier: &str,
        destination_identifier: &str,
        excluded_columns: &[String],
    ) -> SluiceResult<TableSchema> {
        let (schema, table) = split_qualified(source_identifier)?;

        let columns_query = format!(
            r#"SELECT a.attname AS name, a.atttypid AS type_oid, a.atttypmod AS modifier,
                      NOT a.attnotnull AS nullable,
                      COALESCE(i.indisprimary, false) AS primary_key
               FROM pg_attribute a
               JOIN pg_class c ON c.oid = a.attrelid
               JOIN pg_namespace n ON n.oid = c.relnamespace
               LEFT JOIN pg_index i
                 ON i.indrelid = c.oid AND i.indisprimary AND a.attnum = ANY(i.indkey)
               WHERE n.nspname = {} AND c.relname = {} AND a.attnum > 0 AND NOT a.attisdropped
               ORDER BY a.attnum"#,
            quote_literal(schema),
            quote_literal(table)
        );

        let rows = self.query_client.simple_query(&columns_query).await?;
        let mut columns = Vec::new();
        let mut primary_key_columns = Vec::new();

        for message in rows {
            let SimpleQueryMessage::Row(row) = message else {
                continue;
            };

            let name = row.try_get("name")?.ok_or_else(|| missing_column("name"))?;
            if excluded_columns.iter().any(|excluded| excluded == name) {
                continue;
            }

            let type_oid: u32 = row
                .try_get("type_oid")?
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| missing_column("type_oid"))?;
            let modifier: i32 = row
                .try_get("modifier")?
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(-1);
            let nullable = row.try_get("nullable")? == Some("t");
            if row.try_get("primary_key")? == Some("t") {
                primary_key_columns.push(name.to_string());
            }

            columns.push(ColumnSchema::new(
                name,
                kind_from_oid(type_oid),
                modifier,
                nullable,
            ));
        }

        if columns.is_empty() {
            bail!(
                ErrorKind::ValidationError,
                "Source table not found",
                source_identifier.to_string()
            );
        }

        let table_schema = TableSchema::new(destination_identifier, columns, primary_key_columns);
        table_schema.validate()?;

        Ok(table_schema)
    }
}

impl QRepPull for PostgresSource {
    async fn watermark_stats(
        &self,
        table: &str,
        watermark_column: &str,
        last_end: Option<&PartitionValue>,
    ) -> SluiceResult<Option<WatermarkStats>> {
        let quoted_column = quote_identifier(watermark_column);
        let quoted_table = quote_qualified(table);

        let filter = match last_end {
            Some(last_end) => format!(
                "WHERE {quoted_column} > {}",
                partition_value_literal(last_end)
            ),
            None => String::new(),
        };
        let query = format!(
            "SELECT min({quoted_column})::text AS min, max({quoted_column})::text AS max, \
             count(*)::text AS row_count FROM {quoted_table} {filter}"
        );

        for message in self.query_client.simple_query(&query).await? {
            let SimpleQueryMessage::Row(row) = message else {
                continue;
            };

            let row_count: u64 = row
                .try_get("row_count")?
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0);
            let (Some(min), Some(max)) = (row.try_get("min")?, row.try_get("max")?) else {
                return Ok(None);
            };
            if row_count == 0 {
                return Ok(None);
            }

            return Ok(Some(WatermarkStats {
                min: parse_partition_value(min)?,
                max: parse_partition_value(max)?,
                row_count,
            }));
        }

        Ok(None)
    }

    async fn pull_partition(
        &self,
        table: &str,
        watermark_column: &str,
        partition: &Partition,
    ) -> SluiceResult<Vec<RecordItems>> {
        let quoted_column = quote_identifier(watermark_column);
        let quoted_table = quote_qualified(table);
        let query = format!(
            "SELECT * FROM {quoted_table} WHERE {quoted_column} BETWEEN {} AND {}",
            partition_value_literal(&partition.start),
            partition_value_literal(&partition.end)
        );

        let rows = self.query_client.query(&query, &[]).await?;
        rows.iter().map(row_to_items).collect()
    }
}

impl ValidateSource for PostgresSource {
    async fn validate_mirror_source(&self, table_identifiers: &[String]) -> SluiceResult<()> {
        // wal_level must be logical for pgoutput streaming.
        for message in self.query_client.simple_query("SHOW wal_level").await? {
            if let SimpleQueryMessage::Row(row) = message
                && row.try_get(0)? != Some("logical")
            {
                bail!(
                    ErrorKind::ValidationError,
                    "Source wal_level is not logical"
                );
            }
        }

        for identifier in table_identifiers {
            self.table_schema(identifier, identifier, &[]).await?;
        }

        Ok(())
    }
}

impl GetVersion for PostgresSource {
    async fn version(&self) -> SluiceResult<String> {
        for message in self.query_client.simple_query("SELECT version()").await? {
            if let SimpleQueryMessage::Row(row) = message
                && let Some(version) = row.try_get(0)?
            {
                return Ok(version.to_string());
            }
        }

        bail!(ErrorKind::QueryFailed, "Version query returned no row");
    }
}

async fn connect_client(
    config: &PostgresConfig,
    replication: Option<ReplicationMode>,
) -> SluiceResult<Arc<Client>> {
    let mut pg_config = Config::new();
    pg_config
        .host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.username);
    if let Some(password) = &config.password {
        pg_config.password(password);
    }
    if let Some(mode) = replication {
        pg_config.replication_mode(mode);
    }

    if config.tls_enabled {
        let mut root_store = rustls::RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(config.trusted_root_certs.as_bytes()) {
            let cert = cert.map_err(|err| {
                sluice_error!(
                    ErrorKind::ConfigError,
                    "Invalid trusted root certificate",
                    format!("{err:?}")
                )
            })?;
            root_store.add(cert).map_err(|err| {
                sluice_error!(
                    ErrorKind::ConfigError,
                    "Unusable trusted root certificate",
                    err.to_string()
                )
            })?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let (client, connection) = pg_config
            .connect(MakeRustlsConnect::new(tls_config))
            .await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres connection terminated");
            }
        });
        Ok(Arc::new(client))
    } else {
        let (client, connection) = pg_config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres connection terminated");
            }
        });
        Ok(Arc::new(client))
    }
}

struct ConvertedTuple {
    items: RecordItems,
    unchanged_toast_columns: std::collections::BTreeSet<String>,
}

/// Converts pgoutput tuple data into record items.
///
/// Unchanged TOAST columns take their value from the old image when one is
/// present; otherwise they are recorded in the unchanged set and omitted.
fn tuple_to_items(
    schema: &TableSchema,
    tuple_data: &[protocol::TupleData],
    old_items: Option<&RecordItems>,
) -> SluiceResult<ConvertedTuple> {
    let mut items = RecordItems::new();
    let mut unchanged_toast_columns = std::collections::BTreeSet::new();

    for (column, data) in schema.columns.iter().zip(tuple_data.iter()) {
        match data {
            protocol::TupleData::Null => {
                items.insert(column.name.clone(), Value::Null);
            }
            protocol::TupleData::UnchangedToast => match old_items.and_then(|o| o.get(&column.name))
            {
                Some(value) => items.insert(column.name.clone(), value.clone()),
                None => {
                    unchanged_toast_columns.insert(column.name.clone());
                }
            },
            protocol::TupleData::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|err| {
                    sluice_error!(
                        ErrorKind::SerializationFailed,
                        "Tuple data is not valid UTF-8",
                        err.to_string()
                    )
                })?;
                items.insert(column.name.clone(), parse_text_value(column.kind, text)?);
            }
            protocol::TupleData::Binary(_) => {
                bail!(
                    ErrorKind::UnsupportedDataType,
                    "Binary tuple data is not supported",
                    column.name.clone()
                );
            }
        }
    }

    Ok(ConvertedTuple {
        items,
        unchanged_toast_columns,
    })
}

/// Parses a pgoutput text-format value into the engine value model.
fn parse_text_value(kind: ValueKind, text: &str) -> SluiceResult<Value> {
    let parse_error = |detail: &str| {
        sluice_error!(
            ErrorKind::SerializationFailed,
            "Unparsable column text",
            format!("{detail}: '{text}'")
        )
    };

    Ok(match kind {
        ValueKind::Bool => Value::Bool(text == "t" || text == "true"),
        ValueKind::Int8 => Value::Int8(text.parse().map_err(|_| parse_error("int8"))?),
        ValueKind::Int16 => Value::Int16(text.parse().map_err(|_| parse_error("int16"))?),
        ValueKind::Int32 => Value::Int32(text.parse().map_err(|_| parse_error("int32"))?),
        ValueKind::Int64 => Value::Int64(text.parse().map_err(|_| parse_error("int64"))?),
        ValueKind::UInt8 | ValueKind::UInt16 | ValueKind::UInt32 | ValueKind::UInt64 => {
            Value::UInt64(text.parse().map_err(|_| parse_error("uint"))?)
        }
        ValueKind::Float32 => Value::Float32(text.parse().map_err(|_| parse_error("float4"))?),
        ValueKind::Float64 => Value::Float64(text.parse().map_err(|_| parse_error("float8"))?),
        ValueKind::Numeric => {
            Value::Numeric(text.parse::<Decimal>().map_err(|_| parse_error("numeric"))?)
        }
        ValueKind::Uuid => Value::Uuid(text.parse().map_err(|_| parse_error("uuid"))?),
        ValueKind::Bytes => {
            let stripped = text.strip_prefix("\\x").unwrap_or(text);
            let mut bytes = Vec::with_capacity(stripped.len() / 2);
            let raw = stripped.as_bytes();
            for chunk in raw.chunks_exact(2) {
                let hex = std::str::from_utf8(chunk).map_err(|_| parse_error("bytea"))?;
                bytes.push(u8::from_str_radix(hex, 16).map_err(|_| parse_error("bytea"))?);
            }
            Value::Bytes(bytes)
        }
        ValueKind::Timestamp => Value::Timestamp(
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|_| parse_error("timestamp"))?,
        ),
        ValueKind::TimestampTz => Value::TimestampTz(
            DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| parse_error("timestamptz"))?,
        ),
        ValueKind::Time => Value::Time(
            chrono::NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map_err(|_| parse_error("time"))?,
        ),
        ValueKind::Date => Value::Date(
            chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| parse_error("date"))?,
        ),
        ValueKind::Json => Value::Json(serde_json::from_str(text)?),
        ValueKind::String | ValueKind::Array => Value::String(text.to_string()),
    })
}

/// Maps a Postgres type OID to the engine value kind. Unknown types flow
/// through as strings, which is lossless for text output.
fn kind_from_oid(oid: u32) -> ValueKind {
    match oid {
        16 => ValueKind::Bool,
        18 | 1042 | 1043 | 25 | 19 => ValueKind::String,
        17 => ValueKind::Bytes,
        20 => ValueKind::Int64,
        21 => ValueKind::Int16,
        23 => ValueKind::Int32,
        26 => ValueKind::UInt32,
        700 => ValueKind::Float32,
        701 => ValueKind::Float64,
        1700 => ValueKind::Numeric,
        2950 => ValueKind::Uuid,
        1114 => ValueKind::Timestamp,
        1184 => ValueKind::TimestampTz,
        1083 | 1266 => ValueKind::Time,
        1082 => ValueKind::Date,
        114 | 3802 => ValueKind::Json,
        _ => ValueKind::String,
    }
}

/// Converts a typed row into record items, used by QRep partition pulls.
fn row_to_items(row: &tokio_postgres::Row) -> SluiceResult<RecordItems> {
    let mut items = RecordItems::new();

    for (index, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(index)?.map(Value::Bool)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(index)?.map(Value::Int16)
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(index)?.map(Value::Int32)
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(index)?.map(Value::Int64)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(index)?.map(Value::Float32)
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(index)?.map(Value::Float64)
        } else if *ty == Type::NUMERIC {
            row.try_get::<_, Option<Decimal>>(index)?.map(Value::Numeric)
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(index)?.map(Value::Bytes)
        } else if *ty == Type::UUID {
            row.try_get::<_, Option<uuid::Uuid>>(index)?.map(Value::Uuid)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<chrono::NaiveDateTime>>(index)?
                .map(Value::Timestamp)
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(index)?
                .map(Value::TimestampTz)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<chrono::NaiveDate>>(index)?
                .map(Value::Date)
        } else if *ty == Type::TIME {
            row.try_get::<_, Option<chrono::NaiveTime>>(index)?
                .map(Value::Time)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<serde_json::Value>>(index)?
                .map(Value::Json)
        } else {
            row.try_get::<_, Option<String>>(index)?.map(Value::String)
        };

        items.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }

    Ok(items)
}

fn partition_value_literal(value: &PartitionValue) -> String {
    match value {
        PartitionValue::Int(v) => v.to_string(),
        PartitionValue::UInt(v) => v.to_string(),
        PartitionValue::Timestamp(v) => {
            quote_literal(&v.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string()).to_string()
        }
        PartitionValue::Tid(block, offset) => {
            quote_literal(&format!("({block},{offset})")).to_string()
        }
        PartitionValue::ObjectId(v) => quote_literal(v).to_string(),
    }
}

fn parse_partition_value(raw: &str) -> SluiceResult<PartitionValue> {
    if let Ok(int) = raw.parse::<i64>() {
        return Ok(PartitionValue::Int(int));
    }
    if let Ok(ts) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(PartitionValue::Timestamp(ts.and_utc()));
    }
    // timestamptz text carries an offset suffix.
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(PartitionValue::Timestamp(ts.with_timezone(&Utc)));
    }

    bail!(
        ErrorKind::UnsupportedDataType,
        "Unsupported watermark value",
        raw.to_string()
    );
}

fn quote_qualified(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| quote_identifier(part).to_string())
        .collect::<Vec<_>>()
        .join(".")
}

fn split_qualified(identifier: &str) -> SluiceResult<(&str, &str)> {
    identifier.split_once('.').ok_or_else(|| {
        sluice_error!(
            ErrorKind::ValidationError,
            "Table identifier must be schema-qualified",
            identifier.to_string()
        )
    })
}

fn postgres_timestamp(micros_since_pg_epoch: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros_since_pg_epoch + POSTGRES_EPOCH_OFFSET_MICROS)
        .unwrap_or_else(Utc::now)
}

fn missing_column(name: &str) -> SluiceError {
    sluice_error!(
        ErrorKind::QueryFailed,
        "Expected column missing from result",
        name.to_string()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_and_publication_names_are_sanitized() {
        assert_eq!(slot_name("Orders-To-CH"), "sluice_slot_orders_to_ch");
        assert_eq!(publication_name("a.b"), "sluice_pub_a_b");
    }

    #[test]
    fn text_values_parse_into_engine_values() {
        assert_eq!(
            parse_text_value(ValueKind::Bool, "t").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            parse_text_value(ValueKind::Int32, "-5").unwrap(),
            Value::Int32(-5)
        );
        assert_eq!(
            parse_text_value(ValueKind::Bytes, "\\x00ff").unwrap(),
            Value::Bytes(vec![0x00, 0xff])
        );
        let numeric = parse_text_value(ValueKind::Numeric, "10.250").unwrap();
        assert_eq!(numeric, Value::Numeric("10.250".parse().unwrap()));
        assert!(parse_text_value(ValueKind::Int32, "abc").is_err());
    }

    #[test]
    fn timestamp_text_parses_with_fraction() {
        let value = parse_text_value(ValueKind::Timestamp, "2024-05-01 10:20:30.123456").unwrap();
        let Value::Timestamp(ts) = value else {
            panic!("expected timestamp");
        };
        assert_eq!(ts.and_utc().timestamp_subsec_micros(), 123_456);
    }

    #[test]
    fn unchanged_toast_without_old_image_is_recorded() {
        let schema = TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", ValueKind::Int64, -1, false),
                ColumnSchema::new("blob", ValueKind::String, -1, true),
            ],
            vec!["id".to_string()],
        );
        let tuple = vec![
            protocol::TupleData::Text(bytes::Bytes::from_static(b"7")),
            protocol::TupleData::UnchangedToast,
        ];

        let converted = tuple_to_items(&schema, &tuple, None).unwrap();
        assert_eq!(converted.items.get("id"), Some(&Value::Int64(7)));
        assert!(converted.items.get("blob").is_none());
        assert!(converted.unchanged_toast_columns.contains("blob"));
    }

    #[test]
    fn unchanged_toast_with_old_image_reuses_the_value() {
        let schema = TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", ValueKind::Int64, -1, false),
                ColumnSchema::new("blob", ValueKind::String, -1, true),
            ],
            vec!["id".to_string()],
        );
        let mut old_items = RecordItems::new();
        old_items.insert("id", Value::Int64(7));
        old_items.insert("blob", Value::String("kept".to_string()));

        let tuple = vec![
            protocol::TupleData::Text(bytes::Bytes::from_static(b"7")),
            protocol::TupleData::UnchangedToast,
        ];

        let converted = tuple_to_items(&schema, &tuple, Some(&old_items)).unwrap();
        assert_eq!(
            converted.items.get("blob"),
            Some(&Value::String("kept".to_string()))
        );
        assert!(converted.unchanged_toast_columns.is_empty());
    }

    #[test]
    fn oid_mapping_covers_core_types() {
        assert_eq!(kind_from_oid(16), ValueKind::Bool);
        assert_eq!(kind_from_oid(1700), ValueKind::Numeric);
        assert_eq!(kind_from_oid(3802), ValueKind::Json);
        // Unknowns degrade to strings.
        assert_eq!(kind_from_oid(600), ValueKind::String);
    }
}
