use std::collections::HashMap;
use std::sync::Arc;

use sluice::destination::{
    CdcNormalize, CdcSync, NormalizeOutcome, NormalizeRequest, QRepSync, RenameTables,
    ValidateDestination,
};
use sluice::error::SluiceResult;
use sluice::staging::{encode_raw_rows, staged_object_key};
use sluice::types::{
    RawRow, RecordItems, SchemaDelta, TableSchema, Value, raw_table_name,
};
use sluice_config::{ClickHouseConfig, S3Config};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::clickhouse::client::ClickHouseClient;
use crate::clickhouse::schema::{
    VERSION_COLUMN, column_type, create_normalized_table_sql, create_raw_table_sql,
    json_extract_expression, quote,
};
use crate::s3::S3StagingClient;

/// CDC and QRep destination for ClickHouse.
///
/// Raw batches land either through a staged Avro object read back with the
/// `s3` table function (when a staging bucket is configured) or a direct
/// RowBinary insert; both paths are preceded by a batch-scoped delete so
/// retries overwrite partial state. Normalization inserts deduplicated
/// projections of the raw log into ReplacingMergeTree tables.
#[derive(Clone)]
pub struct ClickHouseDestination {
    client: ClickHouseClient,
    staging: Option<(S3StagingClient, String)>,
    /// Per-table engine overrides from the table mappings.
    engine_overrides: Arc<HashMap<String, String>>,
}

impl ClickHouseDestination {
    /// Creates a destination without a staging bucket.
    pub fn new(config: &ClickHouseConfig) -> Self {
        Self {
            client: ClickHouseClient::new(
                config.url.clone(),
                config.username.clone(),
                config.password.clone(),
                config.database.clone(),
            ),
            staging: None,
            engine_overrides: Arc::new(HashMap::new()),
        }
    }

    /// Creates a destination, connecting the staging bucket when configured.
    pub async fn connect(config: &ClickHouseConfig) -> SluiceResult<Self> {
        let mut destination = Self::new(config);

        if let Some(bucket) = &config.staging_bucket {
            let staging = S3StagingClient::connect(
                bucket.clone(),
                &S3Config {
                    url: format!("s3://{bucket}"),
                    access_key_id: None,
                    secret_access_key: None,
                    region: None,
                    endpoint: None,
                },
            )
            .await?;
            destination.staging = Some((staging, bucket.clone()));
        }

        Ok(destination)
    }

    pub fn with_engine_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.engine_overrides = Arc::new(overrides);
        self
    }

    /// Stages the batch as an Avro object and loads it server side, so a
    /// failed upload never leaves rows visible.
    async fn sync_via_stage(
        &self,
        staging: &S3StagingClient,
        bucket: &str,
        mirror_name: &str,
        batch_id: i64,
        rows: &[RawRow],
    ) -> SluiceResult<()> {
        let bytes = encode_raw_rows(rows)?;
        let key = staged_object_key(mirror_name, batch_id, "_raw");
        staging.put_object(&key, bytes).await?;

        self.client
            .execute(&format!(
                "INSERT INTO {} SELECT _peerdb_uid, _peerdb_timestamp, \
                 _peerdb_destination_table_name, _peerdb_data, _peerdb_record_type, \
                 _peerdb_match_data, _peerdb_batch_id, _peerdb_unchanged_toast_columns \
                 FROM s3('https://{bucket}.s3.amazonaws.com/{key}', 'Avro')",
                quote(&raw_table_name(mirror_name)),
            ))
            .await
    }

    fn raw_table(&self, mirror_name: &str) -> String {
        quote(&raw_table_name(mirror_name))
    }

    /// Distinct destination tables touched by one raw batch.
    async fn tables_in_batch(
        &self,
        mirror_name: &str,
        batch_id: i64,
    ) -> SluiceResult<Vec<String>> {
        self.client
            .fetch_strings(&format!(
                "SELECT DISTINCT _peerdb_destination_table_name FROM {} \
                 WHERE _peerdb_batch_id = {batch_id}",
                self.raw_table(mirror_name)
            ))
            .await
    }

    /// Builds the dedup-projection insert normalizing one `(batch, table)`.
    ///
    /// Unchanged-TOAST columns are preserved by joining the current table
    /// state and selecting the existing value whenever the record's
    /// unchanged set names the column.
    fn normalize_insert_sql(
        &self,
        mirror_name: &str,
        request: &NormalizeRequest,
        table: &str,
        schema: &TableSchema,
    ) -> String {
        let quoted_table = quote(table);
        let raw_table = self.raw_table(mirror_name);

        let mut insert_columns: Vec<String> = schema
            .columns
            .iter()
            .map(|column| quote(&column.name))
            .collect();
        let mut select_exprs: Vec<String> = schema
            .columns
            .iter()
            .map(|column| {
                let nullable =
                    column.nullable && !schema.primary_key_columns.contains(&column.name);
                let extracted = json_extract_expression(&column.name, column.kind, nullable);
                format!(
                    "if(has(splitByChar(',', r._peerdb_unchanged_toast_columns), '{name}'), \
                     t.{quoted}, {extracted}) AS {quoted}",
                    name = column.name,
                    quoted = quote(&column.name),
                )
            })
            .collect();

        if let Some(soft_delete_col) = &request.soft_delete_col_name {
            insert_columns.push(quote(soft_delete_col));
            select_exprs.push(format!(
                "r._peerdb_record_type = 2 AS {}",
                quote(soft_delete_col)
            ));
        }
        if let Some(synced_at_col) = &request.synced_at_col_name {
            insert_columns.push(quote(synced_at_col));
            select_exprs.push(format!("now64(6) AS {}", quote(synced_at_col)));
        }
        insert_columns.push(quote(VERSION_COLUMN));
        select_exprs.push(format!("r._peerdb_timestamp AS {}", quote(VERSION_COLUMN)));

        let join_predicate: Vec<String> = schema
            .primary_key_columns
            .iter()
            .map(|pk| {
                let kind = schema
                    .column(pk)
                    .map(|c| c.kind)
                    .unwrap_or(sluice::types::ValueKind::String);
                format!(
                    "t.{} = JSONExtract(r._peerdb_data, '{pk}', '{}')",
                    quote(pk),
                    column_type(kind, false)
                )
            })
            .collect();

        let dedup_keys: Vec<String> = schema
            .primary_key_columns
            .iter()
            .map(|pk| quote(pk))
            .collect();

        let delete_filter = if request.soft_delete_col_name.is_some() {
            // Soft-delete mirrors keep delete records in the projection.
            String::new()
        } else {
            " AND r._peerdb_record_type != 2".to_string()
        };

        format!(
            "INSERT INTO {quoted_table} ({insert_columns}) \
             SELECT {select_exprs} \
             FROM {raw_table} r \
             LEFT JOIN {quoted_table} t ON {join_predicate} \
             WHERE r._peerdb_batch_id = {batch_id} \
             AND r._peerdb_destination_table_name = '{table_literal}' \
             AND r._peerdb_data != ''{delete_filter} \
             ORDER BY r._peerdb_timestamp DESC, r._peerdb_uid DESC \
             LIMIT 1 BY {dedup_keys}",
            insert_columns = insert_columns.join(", "),
            select_exprs = select_exprs.join(", "),
            join_predicate = join_predicate.join(" AND "),
            batch_id = request.batch_id,
            table_literal = table.replace('\'', "''"),
            dedup_keys = dedup_keys.join(", "),
        )
    }

    /// Hard-delete path for mirrors without a soft-delete column.
    fn delete_sql(
        &self,
        mirror_name: &str,
        request: &NormalizeRequest,
        table: &str,
        schema: &TableSchema,
    ) -> Option<String> {
        if request.soft_delete_col_name.is_some() || schema.primary_key_columns.is_empty() {
            return None;
        }

        let predicates: Vec<String> = schema
            .primary_key_columns
            .iter()
            .map(|pk| {
                let kind = schema
                    .column(pk)
                    .map(|c| c.kind)
                    .unwrap_or(sluice::types::ValueKind::String);
                format!(
                    "{} IN (SELECT JSONExtract(_peerdb_data, '{pk}', '{}') FROM {} \
                     WHERE _peerdb_batch_id = {} \
                     AND _peerdb_destination_table_name = '{}' \
                     AND _peerdb_record_type = 2)",
                    quote(pk),
                    column_type(kind, false),
                    self.raw_table(mirror_name),
                    request.batch_id,
                    table.replace('\'', "''"),
                )
            })
            .collect();

        Some(format!(
            "DELETE FROM {} WHERE {}",
            quote(table),
            predicates.join(" AND ")
        ))
    }
}

impl CdcSync for ClickHouseDestination {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn setup_raw_table(&self, mirror_name: &str) -> SluiceResult<()> {
        self.client.execute(&create_raw_table_sql(mirror_name)).await
    }

    async fn sync_batch(
        &self,
        mirror_name: &str,
        batch_id: i64,
        rows: Vec<RawRow>,
    ) -> SluiceResult<()> {
        let raw_table = raw_table_name(mirror_name);

        // A retry of the same batch clears any partial landing first, which
        // makes the append idempotent per batch id.
        self.client
            .execute(&format!(
                "DELETE FROM {} WHERE _peerdb_batch_id = {batch_id}",
                quote(&raw_table)
            ))
            .await?;

        info!(
            mirror = mirror_name,
            batch_id,
            rows = rows.len(),
            "landing raw batch in clickhouse"
        );

        match &self.staging {
            Some((staging, bucket)) => {
                self.sync_via_stage(staging, bucket, mirror_name, batch_id, &rows)
                    .await
            }
            None => self.client.insert_raw_rows(&raw_table, &rows).await,
        }
    }

    async fn replay_schema_deltas(
        &self,
        _mirror_name: &str,
        deltas: &[SchemaDelta],
    ) -> SluiceResult<()> {
        for delta in deltas {
            for column in &delta.added_columns {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                    quote(&delta.destination_table),
                    quote(&column.name),
                    column_type(column.kind, true),
                );
                self.client.execute(&sql).await?;
                info!(
                    table = %delta.destination_table,
                    column = %column.name,
                    "replayed schema delta"
                );
            }
        }

        Ok(())
    }

    async fn remove_table_entries(
        &self,
        mirror_name: &str,
        destination_tables: &[String],
        normalize_batch_id: i64,
        sync_batch_id: i64,
    ) -> SluiceResult<()> {
        for table in destination_tables {
            self.client
                .execute(&format!(
                    "DELETE FROM {} WHERE _peerdb_destination_table_name = '{}' \
                     AND _peerdb_batch_id > {normalize_batch_id} \
                     AND _peerdb_batch_id <= {sync_batch_id}",
                    self.raw_table(mirror_name),
                    table.replace('\'', "''"),
                ))
                .await?;
        }

        Ok(())
    }

    async fn drop_mirror_state(&self, mirror_name: &str) -> SluiceResult<()> {
        self.client
            .execute(&format!(
                "DROP TABLE IF EXISTS {}",
                self.raw_table(mirror_name)
            ))
            .await
    }
}

impl CdcNormalize for ClickHouseDestination {
    async fn setup_normalized_tables(
        &self,
        request: &NormalizeRequest,
        resync: bool,
    ) -> SluiceResult<()> {
        for (table, schema) in &request.table_schemas {
            let name = if resync {
                format!("{table}_resync")
            } else {
                table.clone()
            };

            let sql = create_normalized_table_sql(
                &name,
                schema,
                request.soft_delete_col_name.as_deref(),
                request.synced_at_col_name.as_deref(),
                self.engine_overrides.get(table).map(String::as_str),
            );
            self.client.execute(&sql).await?;
        }

        Ok(())
    }

    async fn normalize_batch(&self, request: &NormalizeRequest) -> SluiceResult<NormalizeOutcome> {
        let tables = self
            .tables_in_batch(&request.mirror_name, request.batch_id)
            .await?;

        let semaphore = Arc::new(Semaphore::new(request.merge_parallelism.max(1)));
        let mut join_set = JoinSet::new();

        for table in tables {
            let Some(schema) = request.table_schemas.get(&table) else {
                debug!(table = %table, "raw rows reference an unmapped table, skipping");
                continue;
            };

            let insert_sql =
                self.normalize_insert_sql(&request.mirror_name, request, &table, schema);
            let delete_sql = self.delete_sql(&request.mirror_name, request, &table, schema);
            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                client.execute(&insert_sql).await?;
                if let Some(delete_sql) = delete_sql {
                    client.execute(&delete_sql).await?;
                }
                Ok::<String, sluice::error::SluiceError>(table)
            });
        }

        let mut tables_merged = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(table)) => tables_merged.push(table),
                Ok(Err(err)) => {
                    // Abort outstanding merges; the normalize cursor will not
                    // advance and the next iteration retries the batch.
                    join_set.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    join_set.abort_all();
                    return Err(sluice::sluice_error!(
                        sluice::error::ErrorKind::WorkerPanic,
                        "Merge worker died",
                        join_err.to_string()
                    ));
                }
            }
        }

        Ok(NormalizeOutcome { tables_merged })
    }
}

impl QRepSync for ClickHouseDestination {
    async fn truncate_destination(&self, destination_table: &str) -> SluiceResult<()> {
        self.client
            .execute(&format!("TRUNCATE TABLE {}", quote(destination_table)))
            .await
    }

    async fn sync_partition(
        &self,
        _mirror_name: &str,
        destination_table: &str,
        partition_id: &str,
        schema: &TableSchema,
        rows: Vec<RecordItems>,
        _upsert: bool,
    ) -> SluiceResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|column| quote(&column.name))
            .collect();

        let mut values = Vec::with_capacity(rows.len());
        for items in &rows {
            let rendered: Vec<String> = schema
                .columns
                .iter()
                .map(|column| value_literal(items.get(&column.name)))
                .collect();
            values.push(format!("({})", rendered.join(", ")));
        }

        let row_count = rows.len() as u64;
        debug!(
            table = destination_table,
            partition = partition_id,
            rows = row_count,
            "inserting qrep partition"
        );

        self.client
            .execute(&format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote(destination_table),
                columns.join(", "),
                values.join(", ")
            ))
            .await?;

        Ok(row_count)
    }
}

impl RenameTables for ClickHouseDestination {
    async fn rename_tables(
        &self,
        _mirror_name: &str,
        renames: &[(String, String)],
        table_schemas: &HashMap<String, TableSchema>,
        soft_delete_col_name: Option<&str>,
    ) -> SluiceResult<()> {
        for (from, to) in renames {
            // Carry over rows missing from the resynced table, soft-deleted.
            if let Some(soft_delete_col) = soft_delete_col_name
                && let Some(schema) = table_schemas.get(to)
                && !schema.primary_key_columns.is_empty()
            {
                let columns: Vec<String> = schema
                    .columns
                    .iter()
                    .map(|column| quote(&column.name))
                    .collect();
                let pk_columns: Vec<String> = schema
                    .primary_key_columns
                    .iter()
                    .map(|pk| quote(pk))
                    .collect();

                let backfill = format!(
                    "INSERT INTO {from} ({columns}, {soft_col}, {version}) \
                     SELECT {columns}, true, toInt64(now64(6)) FROM {to} \
                     WHERE ({pks}) NOT IN (SELECT {pks} FROM {from})",
                    from = quote(from),
                    to = quote(to),
                    columns = columns.join(", "),
                    soft_col = quote(soft_delete_col),
                    version = quote(VERSION_COLUMN),
                    pks = pk_columns.join(", "),
                );
                self.client.execute(&backfill).await?;
            }

            self.client
                .execute(&format!("DROP TABLE IF EXISTS {}", quote(to)))
                .await?;
            self.client
                .execute(&format!(
                    "RENAME TABLE {} TO {}",
                    quote(from),
                    quote(to)
                ))
                .await?;
            info!(from = %from, to = %to, "renamed table");
        }

        Ok(())
    }
}

impl ValidateDestination for ClickHouseDestination {
    async fn validate_mirror_destination(
        &self,
        _table_schemas: &HashMap<String, TableSchema>,
    ) -> SluiceResult<()> {
        // A trivial round trip proves connectivity, auth and database scope.
        self.client.execute("SELECT 1").await
    }
}

/// Renders one value as a ClickHouse literal.
fn value_literal(value: Option<&Value>) -> String {
    let Some(value) = value else {
        return "NULL".to_string();
    };

    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(v) => if *v { "true" } else { "false" }.to_string(),
        Value::Int8(v) => v.to_string(),
        Value::Int16(v) => v.to_string(),
        Value::Int32(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::UInt8(v) => v.to_string(),
        Value::UInt16(v) => v.to_string(),
        Value::UInt32(v) => v.to_string(),
        Value::UInt64(v) => v.to_string(),
        Value::Float32(v) => v.to_string(),
        Value::Float64(v) => v.to_string(),
        Value::Numeric(v) => v.to_string(),
        other => format!(
            "'{}'",
            literal_text(other).replace('\\', "\\\\").replace('\'', "\\'")
        ),
    }
}

fn literal_text(value: &Value) -> String {
    match value.to_json() {
        serde_json::Value::String(text) => text,
        rendered => rendered.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice::types::{ColumnSchema, ValueKind};

    fn destination() -> ClickHouseDestination {
        ClickHouseDestination::new(&ClickHouseConfig {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            username: "default".to_string(),
            password: None,
            staging_bucket: None,
        })
    }

    fn orders_schema() -> TableSchema {
        TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", ValueKind::Int64, -1, false),
                ColumnSchema::new("description", ValueKind::String, -1, true),
            ],
            vec!["id".to_string()],
        )
    }

    fn request(soft_delete: bool) -> NormalizeRequest {
        let mut table_schemas = HashMap::new();
        table_schemas.insert("orders".to_string(), orders_schema());
        NormalizeRequest {
            mirror_name: "m1".to_string(),
            batch_id: 9,
            table_schemas,
            soft_delete_col_name: soft_delete.then(|| "_peerdb_is_deleted".to_string()),
            synced_at_col_name: Some("_peerdb_synced_at".to_string()),
            merge_parallelism: 4,
        }
    }

    #[test]
    fn normalize_sql_dedups_latest_first_by_pk() {
        let destination = destination();
        let request = request(true);
        let sql =
            destination.normalize_insert_sql("m1", &request, "orders", &orders_schema());

        assert!(sql.contains("_peerdb_batch_id = 9"));
        assert!(sql.contains("ORDER BY r._peerdb_timestamp DESC, r._peerdb_uid DESC"));
        assert!(sql.contains("LIMIT 1 BY `id`"));
        assert!(sql.contains("r._peerdb_record_type = 2 AS `_peerdb_is_deleted`"));
    }

    #[test]
    fn normalize_sql_preserves_unchanged_toast_columns() {
        let destination = destination();
        let request = request(true);
        let sql =
            destination.normalize_insert_sql("m1", &request, "orders", &orders_schema());

        assert!(sql.contains(
            "if(has(splitByChar(',', r._peerdb_unchanged_toast_columns), 'description'), \
             t.`description`,"
        ));
    }

    #[test]
    fn hard_delete_mirrors_filter_deletes_and_emit_delete_statement() {
        let destination = destination();
        let request = request(false);
        let sql =
            destination.normalize_insert_sql("m1", &request, "orders", &orders_schema());
        assert!(sql.contains("r._peerdb_record_type != 2"));

        let delete = destination
            .delete_sql("m1", &request, "orders", &orders_schema())
            .unwrap();
        assert!(delete.contains("_peerdb_record_type = 2"));
        assert!(delete.starts_with("DELETE FROM `orders`"));
    }

    #[test]
    fn value_literals_escape_strings() {
        assert_eq!(value_literal(Some(&Value::Int64(5))), "5");
        assert_eq!(
            value_literal(Some(&Value::String("it's".to_string()))),
            "'it\\'s'"
        );
        assert_eq!(value_literal(None), "NULL");
    }
}
