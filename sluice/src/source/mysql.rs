//! MySQL/MariaDB source: row-based binlog streaming.
//!
//! Positions are `(binlog file sequence << 32) | log_pos` so the checkpoint
//! id is monotone across file rotations; the checkpoint text carries the
//! executed GTID set when GTID mode is on, or `file:pos` otherwise. Column
//! names are resolved from `information_schema` by ordinal, which requires
//! `binlog_row_metadata = FULL` only for replica identity correctness, not
//! for naming.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData, TableMapEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, OptsBuilder};
use rust_decimal::Decimal;
use sluice_config::{MySqlConfig, TableMapping};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::{BufferKey, ChangeBuffer};
use crate::error::{ErrorKind, SluiceResult};
use crate::qrep::{Partition, PartitionValue};
use crate::source::{
    CdcPull, GetTableSchema, GetVersion, IdleDeadline, PullOutcome, PullRequest, QRepPull,
    ReplicationSetup, ValidateSource, WatermarkStats,
};
use crate::types::{
    ChangeMeta, ChangeRecord, Checkpoint, ColumnSchema, RecordItems, SchemaDelta, TableSchema,
    Value, ValueKind,
};
use crate::{bail, sluice_error};

/// Binlog settings the mirror refuses to run without.
const REQUIRED_SETTINGS: &[(&str, &str)] = &[
    ("binlog_format", "ROW"),
    ("binlog_row_image", "FULL"),
    ("binlog_row_metadata", "FULL"),
];

struct StreamState {
    stream: BinlogStream,
    /// Sequence number parsed from the current binlog file name.
    file_seq: u64,
    current_file: String,
    /// Commit time of the transaction currently streaming.
    current_commit_time: DateTime<Utc>,
}

/// MySQL CDC and QRep source.
pub struct MySqlSource {
    mirror_name: String,
    config: MySqlConfig,
    mappings: HashMap<String, String>,
    conn: Mutex<Conn>,
    state: Mutex<Option<StreamState>>,
    /// Schemas by source identifier, fetched from information_schema.
    schemas: Mutex<HashMap<String, TableSchema>>,
    pulling: AtomicBool,
    server_id: u32,
    last_offset: AtomicU64,
    /// `file:pos` text of the last acknowledged offset, used for resume.
    last_offset_text: Mutex<String>,
}

impl MySqlSource {
    pub async fn connect(
        mirror_name: impl Into<String>,
        config: MySqlConfig,
        table_mappings: &[TableMapping],
    ) -> SluiceResult<Self> {
        let mirror_name = mirror_name.into();
        let conn = Conn::new(build_opts(&config)).await?;

        let mappings = table_mappings
            .iter()
            .map(|m| {
                (
                    m.source_identifier.clone(),
                    m.destination_identifier.clone(),
                )
            })
            .collect();

        // Server ids must be unique per replica; derive one from the mirror.
        let server_id = 1_000_000 + (fxhash(&mirror_name) % 1_000_000) as u32;

        info!(mirror = %mirror_name, host = %config.host, server_id, "connected mysql source");

        Ok(Self {
            mirror_name,
            config,
            mappings,
            conn: Mutex::new(conn),
            state: Mutex::new(None),
            schemas: Mutex::new(HashMap::new()),
            pulling: AtomicBool::new(false),
            server_id,
            last_offset: AtomicU64::new(0),
            last_offset_text: Mutex::new(String::new()),
        })
    }

    async fn validate_binlog_settings(&self) -> SluiceResult<()> {
        let mut conn = self.conn.lock().await;

        let log_bin: Option<(String, String)> = conn
            .query_first("SHOW VARIABLES LIKE 'log_bin'")
            .await?;
        if log_bin.map(|(_, value)| value.to_uppercase()) != Some("ON".to_string()) {
            bail!(
                ErrorKind::ValidationError,
                "Binary logging is disabled on the source"
            );
        }

        for (name, expected) in REQUIRED_SETTINGS {
            let row: Option<(String, String)> = conn
                .query_first(format!("SHOW VARIABLES LIKE '{name}'"))
                .await?;
            let actual = row.map(|(_, value)| value.to_uppercase());
            if actual.as_deref() != Some(*expected) {
                bail!(
                    ErrorKind::ValidationError,
                    "Unsupported binlog setting",
                    format!(
                        "{name} must be {expected}, found {}",
                        actual.unwrap_or_else(|| "<unset>".to_string())
                    )
                );
            }
        }

        Ok(())
    }

    /// Reads the current binlog coordinates and executed GTID set.
    async fn current_position(&self) -> SluiceResult<Checkpoint> {
        let mut conn = self.conn.lock().await;

        // MySQL 8.4 renamed SHOW MASTER STATUS.
        let mut row: Option<(String, u64, String, String, String)> =
            match conn.query_first("SHOW MASTER STATUS").await {
                Ok(row) => row,
                Err(_) => None,
            };
        if row.is_none() {
            row = conn.query_first("SHOW BINARY LOG STATUS").await?;
        }

        let Some((file, position, _do_db, _ignore_db, gtid_set)) = row else {
            bail!(
                ErrorKind::BinlogInvalid,
                "Source reported no binlog position"
            );
        };

        let id = encode_offset(file_sequence(&file), position);
        let text = if self.config.use_gtid && !gtid_set.is_empty() {
            gtid_set
        } else {
            format!("{file}:{position}")
        };

        Ok(Checkpoint::with_text(id, text))
    }

    async fn schema_for(&self, source_identifier: &str) -> SluiceResult<Option<TableSchema>> {
        {
            let schemas = self.schemas.lock().await;
            if let Some(schema) = schemas.get(source_identifier) {
                return Ok(Some(schema.clone()));
            }
        }

        let Some(destination) = self.mappings.get(source_identifier).cloned() else {
            return Ok(None);
        };

        let schema = self
            .table_schema(source_identifier, &destination, &[])
            .await?;
        self.schemas
            .lock()
            .await
            .insert(source_identifier.to_string(), schema.clone());

        Ok(Some(schema))
    }

    /// Refreshes a table's schema when the binlog announces a different
    /// column count than the cached shape, emitting the delta.
    ///
    /// MySQL has no relation messages; the table-map event's column count is
    /// the only in-stream schema signal, so the new shape is fetched from
    /// `information_schema`.
    async fn refresh_schema_if_changed(
        &self,
        source_identifier: &str,
        destination_table: &str,
        cached: TableSchema,
        columns_in_event: usize,
        deltas: &mut Vec<SchemaDelta>,
    ) -> SluiceResult<TableSchema> {
        if columns_in_event == cached.columns.len() {
            return Ok(cached);
        }

        let fresh = self
            .table_schema(source_identifier, destination_table, &[])
            .await?;

        let added_columns = cached.added_columns_in(&fresh);
        if !added_columns.is_empty() {
            deltas.push(SchemaDelta {
                source_table: source_identifier.to_string(),
                destination_table: destination_table.to_string(),
                added_columns,
                nullable_enabled: cached.nullable_enabled,
            });
        } else if fresh.columns.len() < cached.columns.len() {
            bail!(
                ErrorKind::SchemaDrift,
                "Source dropped a replicated column",
                source_identifier.to_string()
            );
        }

        self.schemas
            .lock()
            .await
            .insert(source_identifier.to_string(), fresh.clone());

        Ok(fresh)
    }

    async fn handle_rows_event(
        &self,
        state: &mut StreamState,
        table_map: &TableMapEvent<'_>,
        rows_event: RowsEventData<'_>,
        checkpoint: Checkpoint,
        buffer: &mut ChangeBuffer,
        deltas: &mut Vec<SchemaDelta>,
    ) -> SluiceResult<usize> {
        let source_identifier = format!("{}.{}", table_map.database_name(), table_map.table_name());
        let Some(schema) = self.schema_for(&source_identifier).await? else {
            return Ok(0);
        };
        let Some(destination_table) = self.mappings.get(&source_identifier).cloned() else {
            return Ok(0);
        };

        let schema = self
            .refresh_schema_if_changed(
                &source_identifier,
                &destination_table,
                schema,
                table_map.columns_count() as usize,
                deltas,
            )
            .await?;

        let meta = ChangeMeta {
            checkpoint,
            commit_time: state.current_commit_time,
            source_table: source_identifier,
            destination_table,
        };

        let mut accepted = 0usize;
        match &rows_event {
            RowsEventData::WriteRowsEvent(event) => {
                for row in event.rows(table_map) {
                    let (_, after) = row?;
                    let Some(after) = after else { continue };
                    let items = binlog_row_to_items(&schema, after)?;
                    let key = BufferKey::from_items(&schema, &items);
                    buffer.set(
                        key,
                        ChangeRecord::Insert {
                            meta: meta.clone(),
                            items,
                        },
                    )?;
                    accepted += 1;
                }
            }
            RowsEventData::UpdateRowsEvent(event) => {
                for row in event.rows(table_map) {
                    let (before, after) = row?;
                    let Some(after) = after else { continue };
                    let items = binlog_row_to_items(&schema, after)?;
                    let old_items = before
                        .map(|before| binlog_row_to_items(&schema, before))
                        .transpose()?;
                    let key = BufferKey::from_items(&schema, &items);
                    buffer.set(
                        key,
                        ChangeRecord::Update {
                            meta: meta.clone(),
                            items,
                            old_items,
                            // Row images are FULL; MySQL never omits columns.
                            unchanged_toast_columns: Default::default(),
                        },
                    )?;
                    accepted += 1;
                }
            }
            RowsEventData::DeleteRowsEvent(event) => {
                for row in event.rows(table_map) {
                    let (before, _) = row?;
                    let Some(before) = before else { continue };
                    let old_items = binlog_row_to_items(&schema, before)?;
                    let key = BufferKey::from_items(&schema, &old_items);
                    buffer.set(
                        key,
                        ChangeRecord::Delete {
                            meta: meta.clone(),
                            old_items,
                        },
                    )?;
                    accepted += 1;
                }
            }
            _ => {}
        }

        Ok(accepted)
    }
}

impl CdcPull for MySqlSource {
    async fn setup_replication(
        &self,
        start_offset: &Checkpoint,
    ) -> SluiceResult<ReplicationSetup> {
        self.validate_binlog_settings().await?;

        let initial_offset = if start_offset.id == 0 {
            self.current_position().await?
        } else {
            start_offset.clone()
        };

        Ok(ReplicationSetup {
            slot_name: format!("binlog_{}", self.mirror_name),
            snapshot_name: None,
            supports_tid_scans: false,
            initial_offset,
        })
    }

    async fn pull(&self, request: PullRequest, buffer: &mut ChangeBuffer) -> SluiceResult<PullOutcome> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            let resume_text = self.last_offset_text.lock().await.clone();
            let (file, position) = match resume_text.rsplit_once(':') {
                Some((file, position)) => {
                    (file.to_string(), position.parse::<u64>().unwrap_or(4))
                }
                None => (String::new(), 4),
            };

            let conn = Conn::new(build_opts(&self.config)).await?;
            let mut binlog_request = BinlogStreamRequest::new(self.server_id);
            if !file.is_empty() {
                binlog_request = binlog_request
                    .with_filename(file.as_bytes())
                    .with_pos(position);
            }
            let stream = conn.get_binlog_stream(binlog_request).await?;

            *guard = Some(StreamState {
                stream,
                file_seq: file_sequence(&file),
                current_file: file,
                current_commit_time: Utc::now(),
            });
            debug!(mirror = %self.mirror_name, "binlog stream opened");
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

        let Ok(mut conn) = self.conn.try_lock() else {
            return Ok(());
        };
        conn.query_drop("SELECT 1").await?;

        Ok(())
    }

    async fn ack(&self, offset: &Checkpoint) -> SluiceResult<()> {
        // The binlog protocol has no flush acknowledgement; retention is
        // driven by expire_logs settings. Remember the offset for resume.
        let previous = self.last_offset.fetch_max(offset.id, Ordering::AcqRel);
        if offset.id >= previous && offset.text.contains(':') {
            *self.last_offset_text.lock().await = offset.text.clone();
        }
        Ok(())
    }

    async fn cleanup(&self, _mirror_name: &str) -> SluiceResult<()> {
        // Nothing persists server-side for a binlog reader.
        self.state.lock().await.take();
        Ok(())
    }
}

impl MySqlSource {
    async fn pull_inner(
        &self,
        state: &mut StreamState,
        request: PullRequest,
        buffer: &mut ChangeBuffer,
    ) -> SluiceResult<PullOutcome> {
        let mut outcome = PullOutcome::default();
        let mut accepted = 0usize;

        // The table map event preceding each rows event, kept as an owned
        // copy because rows events borrow from it.
        let mut current_table_map: Option<TableMapEvent<'static>> = None;

        // The idle window re-arms only on accepted records; rotate, table
        // map and transaction-marker events must not postpone the flush.
        let mut idle = IdleDeadline::start(request.idle_timeout);

        loop {
            if accepted >= request.batch_limit {
                break;
            }

            let next = tokio::time::timeout_at(idle.deadline(), state.stream.next()).await;
            let event = match next {
                Err(_) => break,
                Ok(None) => {
                    return Err(sluice_error!(ErrorKind::Eof, "Binlog stream ended"));
                }
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(event))) => event,
            };

            let header = event.header();
            let log_pos = header.log_pos() as u64;
            let timestamp = header.timestamp();
            if timestamp != 0 {
                state.current_commit_time = DateTime::from_timestamp(timestamp as i64, 0)
                    .unwrap_or_else(Utc::now);
            }

            let Ok(Some(data)) = event.read_data() else {
                continue;
            };

            match data {
                EventData::RotateEvent(rotate) => {
                    state.current_file = rotate.name().to_string();
                    state.file_seq = file_sequence(&state.current_file);
                    debug!(file = %state.current_file, "binlog rotated");
                }
                EventData::TableMapEvent(table_map) => {
                    current_table_map = Some(table_map.into_owned());
                }
                EventData::RowsEvent(rows_event) => {
                    let Some(table_map) = current_table_map.as_ref() else {
                        warn!("rows event without a preceding table map, skipping");
                        continue;
                    };

                    let checkpoint = Checkpoint::with_text(
                        encode_offset(state.file_seq, log_pos),
                        format!("{}:{log_pos}", state.current_file),
                    );

                    let added = self
                        .handle_rows_event(
                            state,
                            table_map,
                            rows_event,
                            checkpoint.clone(),
                            buffer,
                            &mut outcome.schema_deltas,
                        )
                        .await?;
                    if added > 0 {
                        idle.record_accepted();
                    }
                    accepted += added;
                    outcome.offset_reached = checkpoint;
                }
                EventData::XidEvent(_) | EventData::QueryEvent(_) => {
                    // Transaction boundary: the offset is now fully durable.
                    outcome.offset_reached = Checkpoint::with_text(
                        encode_offset(state.file_seq, log_pos),
                        format!("{}:{log_pos}", state.current_file),
                    );
                }
                _ => {}
            }
        }

        outcome.records = accepted;
        if outcome.offset_reached.id == 0 {
            outcome.offset_reached =
                Checkpoint::new(self.last_offset.load(Ordering::Acquire));
        }

        Ok(outcome)
    }
}

impl GetTableSchema for MySqlSource {
    async fn table_schema(
        &self,
        source_identifier: &str,
        destination_identifier: &str,
        excluded_columns: &[String],
    ) -> SluiceResult<TableSchema> {
        let (database, table) = source_identifier.split_once('.').ok_or_else(|| {
            sluice_error!(
                ErrorKind::ValidationError,
                "Table identifier must be database-qualified",
                source_identifier.to_string()
            )
        })?;

        let mut conn = self.conn.lock().await;
        let rows: Vec<(String, String, String, String)> = conn
            .exec(
                "SELECT column_name, data_type, is_nullable, column_key \
                 FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
                (database, table),
            )
            .await?;

        if rows.is_empty() {
            bail!(
                ErrorKind::ValidationError,
                "Source table not found",
                source_identifier.to_string()
            );
        }

        let mut columns = Vec::with_capacity(rows.len());
        let mut primary_key_columns = Vec::new();
        for (name, data_type, is_nullable, column_key) in rows {
            if excluded_columns.iter().any(|excluded| *excluded == name) {
                continue;
            }
            if column_key == "PRI" {
                primary_key_columns.push(name.clone());
            }
            columns.push(ColumnSchema::new(
                name,
                kind_from_mysql_type(&data_type),
                -1,
                is_nullable == "YES",
            ));
        }

        let schema = TableSchema::new(destination_identifier, columns, primary_key_columns);
        schema.validate()?;

        Ok(schema)
    }
}

impl QRepPull for MySqlSource {
    async fn watermark_stats(
        &self,
        table: &str,
        watermark_column: &str,
        last_end: Option<&PartitionValue>,
    ) -> SluiceResult<Option<WatermarkStats>> {
        let mut conn = self.conn.lock().await;

        let filter = match last_end {
            Some(PartitionValue::Int(v)) => format!("WHERE `{watermark_column}` > {v}"),
            Some(PartitionValue::UInt(v)) => format!("WHERE `{watermark_column}` > {v}"),
            Some(_) | None => String::new(),
        };
        let query = format!(
            "SELECT CAST(MIN(`{watermark_column}`) AS CHAR), \
             CAST(MAX(`{watermark_column}`) AS CHAR), COUNT(*) \
             FROM {} {filter}",
            quote_mysql_qualified(table)
        );

        let row: Option<(Option<String>, Option<String>, u64)> = conn.query_first(query).await?;
        let Some((Some(min), Some(max), row_count)) = row else {
            return Ok(None);
        };
        if row_count == 0 {
            return Ok(None);
        }

        let parse = |raw: &str| {
            raw.parse::<i64>().map(PartitionValue::Int).map_err(|_| {
                sluice_error!(
                    ErrorKind::UnsupportedDataType,
                    "Unsupported watermark value",
                    raw.to_string()
                )
            })
        };

        Ok(Some(WatermarkStats {
            min: parse(&min)?,
            max: parse(&max)?,
            row_count,
        }))
    }

    async fn pull_partition(
        &self,
        table: &str,
        watermark_column: &str,
        partition: &Partition,
    ) -> SluiceResult<Vec<RecordItems>> {
        let (PartitionValue::Int(start), PartitionValue::Int(end)) =
            (&partition.start, &partition.end)
        else {
            bail!(
                ErrorKind::UnsupportedDataType,
                "MySQL partitions support integer watermarks only"
            );
        };

        let mut conn = self.conn.lock().await;
        let query = format!(
            "SELECT * FROM {} WHERE `{watermark_column}` BETWEEN {start} AND {end}",
            quote_mysql_qualified(table)
        );

        let rows: Vec<mysql_async::Row> = conn.query(query).await?;
        rows.into_iter().map(mysql_row_to_items).collect()
    }
}

impl ValidateSource for MySqlSource {
    async fn validate_mirror_source(&self, table_identifiers: &[String]) -> SluiceResult<()> {
        self.validate_binlog_settings().await?;

        for identifier in table_identifiers {
            self.table_schema(identifier, identifier, &[]).await?;
        }

        Ok(())
    }
}

impl GetVersion for MySqlSource {
    async fn version(&self) -> SluiceResult<String> {
        let mut conn = self.conn.lock().await;
        let version: Option<String> = conn.query_first("SELECT VERSION()").await?;
        version.ok_or_else(|| {
            sluice_error!(ErrorKind::QueryFailed, "Version query returned no row")
        })
    }
}

fn build_opts(config: &MySqlConfig) -> Opts {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .db_name(Some(config.database.clone()))
        .user(Some(config.username.clone()));
    if let Some(password) = &config.password {
        builder = builder.pass(Some(password.clone()));
    }
    builder.into()
}

/// Converts one binlog row into record items, mapping values by ordinal.
fn binlog_row_to_items(schema: &TableSchema, row: BinlogRow) -> SluiceResult<RecordItems> {
    let mut items = RecordItems::new();

    for (index, column) in schema.columns.iter().enumerate() {
        let value = match row.as_ref(index) {
            Some(BinlogValue::Value(value)) => mysql_value_to_value(column.kind, value.clone()),
            Some(_) | None => Value::Null,
        };
        items.insert(column.name.clone(), value);
    }

    Ok(items)
}

fn mysql_row_to_items(row: mysql_async::Row) -> SluiceResult<RecordItems> {
    let mut items = RecordItems::new();
    let columns = row.columns();

    for (index, column) in columns.iter().enumerate() {
        let value = row
            .as_ref(index)
            .map(|value| mysql_value_to_value(ValueKind::String, value.clone()))
            .unwrap_or(Value::Null);
        items.insert(column.name_str().to_string(), value);
    }

    Ok(items)
}

/// Maps a wire value to the engine model, using the schema kind as a hint
/// for byte-encoded values.
fn mysql_value_to_value(kind: ValueKind, value: mysql_async::Value) -> Value {
    use mysql_async::Value as MyValue;

    match value {
        MyValue::NULL => Value::Null,
        MyValue::Int(v) => match kind {
            ValueKind::Bool => Value::Bool(v != 0),
            _ => Value::Int64(v),
        },
        MyValue::UInt(v) => Value::UInt64(v),
        MyValue::Float(v) => Value::Float32(v),
        MyValue::Double(v) => Value::Float64(v),
        MyValue::Bytes(bytes) => match kind {
            ValueKind::Bytes => Value::Bytes(bytes),
            ValueKind::Numeric => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse::<Decimal>().ok())
                .map(Value::Numeric)
                .unwrap_or(Value::Null),
            ValueKind::Json => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| serde_json::from_str(text).ok())
                .map(Value::Json)
                .unwrap_or(Value::Null),
            _ => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        },
        MyValue::Date(year, month, day, hour, minute, second, micros) => {
            match chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32).and_then(
                |date| {
                    date.and_hms_micro_opt(hour as u32, minute as u32, second as u32, micros)
                },
            ) {
                Some(ts) if kind == ValueKind::Date => Value::Date(ts.date()),
                Some(ts) => Value::Timestamp(ts),
                None => Value::Null,
            }
        }
        MyValue::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_seconds = (days * 24 + hours as u32) as i64 * 3600
                + minutes as i64 * 60
                + seconds as i64;
            let signed = if negative { -total_seconds } else { total_seconds };
            chrono::NaiveTime::from_num_seconds_from_midnight_opt(
                signed.rem_euclid(86_400) as u32,
                micros * 1_000,
            )
            .map(Value::Time)
            .unwrap_or(Value::Null)
        }
    }
}

fn kind_from_mysql_type(data_type: &str) -> ValueKind {
    match data_type {
        "tinyint" => ValueKind::Int8,
        "smallint" => ValueKind::Int16,
        "mediumint" | "int" => ValueKind::Int32,
        "bigint" => ValueKind::Int64,
        "float" => ValueKind::Float32,
        "double" => ValueKind::Float64,
        "decimal" | "numeric" => ValueKind::Numeric,
        "bit" | "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
            ValueKind::Bytes
        }
        "datetime" | "timestamp" => ValueKind::Timestamp,
        "date" => ValueKind::Date,
        "time" => ValueKind::Time,
        "json" => ValueKind::Json,
        _ => ValueKind::String,
    }
}

/// Parses the numeric suffix of a binlog file name (`binlog.000042` -> 42).
fn file_sequence(file: &str) -> u64 {
    file.rsplit('.')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(0)
}

fn encode_offset(file_seq: u64, position: u64) -> u64 {
    (file_seq << 32) | (position & 0xFFFF_FFFF)
}

fn decode_offset(offset: u64) -> (u64, u64) {
    (offset >> 32, offset & 0xFFFF_FFFF)
}

fn quote_mysql_qualified(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("`{}`", part.replace('`', "")))
        .collect::<Vec<_>>()
        .join(".")
}

fn fxhash(input: &str) -> u64 {
    // Small stable hash for deriving server ids; not cryptographic.
    let mut hash = 0xcbf29ce484222325u64;
    for byte in input.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_monotone_across_file_rotation() {
        let early = encode_offset(file_sequence("binlog.000001"), 4_000_000);
        let late = encode_offset(file_sequence("binlog.000002"), 4);
        assert!(late > early);

        let (seq, pos) = decode_offset(late);
        assert_eq!(seq, 2);
        assert_eq!(pos, 4);
    }

    #[test]
    fn mysql_types_map_to_engine_kinds() {
        assert_eq!(kind_from_mysql_type("bigint"), ValueKind::Int64);
        assert_eq!(kind_from_mysql_type("decimal"), ValueKind::Numeric);
        assert_eq!(kind_from_mysql_type("longblob"), ValueKind::Bytes);
        assert_eq!(kind_from_mysql_type("varchar"), ValueKind::String);
    }

    #[test]
    fn decimal_bytes_parse_through_schema_hint() {
        let value = mysql_value_to_value(
            ValueKind::Numeric,
            mysql_async::Value::Bytes(b"10.25".to_vec()),
        );
        assert_eq!(value, Value::Numeric("10.25".parse().unwrap()));
    }

    #[test]
    fn server_ids_are_stable_per_mirror() {
        assert_eq!(fxhash("mirror_a"), fxhash("mirror_a"));
        assert_ne!(fxhash("mirror_a"), fxhash("mirror_b"));
    }
}
