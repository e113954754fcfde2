use std::collections::HashMap;
use std::sync::Arc;

use sluice::destination::{
    CdcNormalize, CdcSync, NormalizeOutcome, NormalizeRequest, QRepSync, RenameTables,
    ValidateDestination,
};
use sluice::error::{ErrorKind, SluiceResult};
use sluice::normalize::{MergeStatementGenerator, SnowflakeDialect};
use sluice::staging::{encode_raw_rows, staged_object_key};
use sluice::types::{
    RawRow, RecordItems, SchemaDelta, TableSchema, Value, ValueKind, raw_table_name,
};
use sluice::{bail, sluice_error};
use sluice_config::{S3Config, SnowflakeConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::s3::S3StagingClient;
use crate::snowflake::client::SnowflakeClient;

const DEFAULT_RAW_SCHEMA: &str = "_PEERDB_INTERNAL";

const CREATE_RAW_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS {schema}.{table}(\
 _PEERDB_UID STRING NOT NULL, _PEERDB_TIMESTAMP INT NOT NULL,\
 _PEERDB_DESTINATION_TABLE_NAME STRING NOT NULL, _PEERDB_DATA STRING NOT NULL,\
 _PEERDB_RECORD_TYPE INTEGER NOT NULL, _PEERDB_MATCH_DATA STRING,\
 _PEERDB_BATCH_ID INT, _PEERDB_UNCHANGED_TOAST_COLUMNS STRING)";

/// Snowflake CDC and QRep destination.
///
/// Batches land either through `COPY INTO` from a staged Avro object (when a
/// staging bucket is configured) or a multi-row insert; both paths clear the
/// batch id first so retries overwrite partial state. Normalization executes
/// the shared MERGE generator, one statement per `(batch, table)`.
#[derive(Clone)]
pub struct SnowflakeDestination {
    client: SnowflakeClient,
    raw_schema: String,
    staging: Option<S3StagingClient>,
    staging_bucket: Option<String>,
}

impl SnowflakeDestination {
    pub async fn connect(config: SnowflakeConfig) -> SluiceResult<Self> {
        let raw_schema = config
            .metadata_schema
            .clone()
            .unwrap_or_else(|| DEFAULT_RAW_SCHEMA.to_string());

        let staging = match &config.staging_bucket {
            Some(bucket) => Some(
                S3StagingClient::connect(
                    bucket.clone(),
                    &S3Config {
                        url: format!("s3://{bucket}"),
                        access_key_id: None,
                        secret_access_key: None,
                        region: None,
                        endpoint: None,
                    },
                )
                .await?,
            ),
            None => None,
        };

        let staging_bucket = config.staging_bucket.clone();

        Ok(Self {
            client: SnowflakeClient::new(config)?,
            raw_schema,
            staging,
            staging_bucket,
        })
    }

    fn raw_table(&self, mirror_name: &str) -> String {
        format!("{}.{}", self.raw_schema, raw_table_name(mirror_name))
    }

    fn stage_name(&self, mirror_name: &str) -> String {
        format!(
            "{}.SLUICE_STAGE_{}",
            self.raw_schema,
            raw_table_name(mirror_name)
        )
    }

    async fn ensure_raw_schema(&self, mirror_name: &str) -> SluiceResult<()> {
        self.client
            .execute(
                mirror_name,
                &format!("CREATE TRANSIENT SCHEMA IF NOT EXISTS {}", self.raw_schema),
            )
            .await?;
        Ok(())
    }

    /// Distinct destination tables with rows in one batch.
    async fn tables_in_batch(
        &self,
        mirror_name: &str,
        batch_id: i64,
    ) -> SluiceResult<Vec<String>> {
        let rows = self
            .client
            .execute(
                mirror_name,
                &format!(
                    "SELECT DISTINCT _PEERDB_DESTINATION_TABLE_NAME FROM {} \
                     WHERE _PEERDB_BATCH_ID = {batch_id}",
                    self.raw_table(mirror_name)
                ),
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    /// Distinct unchanged-TOAST column sets per table for one batch,
    /// excluding deletes.
    async fn unchanged_toast_sets(
        &self,
        mirror_name: &str,
        batch_id: i64,
    ) -> SluiceResult<HashMap<String, Vec<String>>> {
        let rows = self
            .client
            .execute(
                mirror_name,
                &format!(
                    "SELECT _PEERDB_DESTINATION_TABLE_NAME, _PEERDB_UNCHANGED_TOAST_COLUMNS \
                     FROM {} WHERE _PEERDB_BATCH_ID = {batch_id} AND _PEERDB_RECORD_TYPE != 2 \
                     GROUP BY _PEERDB_DESTINATION_TABLE_NAME, _PEERDB_UNCHANGED_TOAST_COLUMNS",
                    self.raw_table(mirror_name)
                ),
            )
            .await?;

        let mut sets: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let mut cells = row.into_iter();
            let Some(Some(table)) = cells.next() else { continue };
            let set = cells.next().flatten().unwrap_or_default();
            sets.entry(table).or_default().push(set);
        }

        Ok(sets)
    }

    async fn sync_via_stage(
        &self,
        staging: &S3StagingClient,
        mirror_name: &str,
        batch_id: i64,
        rows: &[RawRow],
    ) -> SluiceResult<()> {
        let bytes = encode_raw_rows(rows)?;
        let key = staged_object_key(mirror_name, batch_id, "_raw");
        staging.put_object(&key, bytes).await?;

        let copy = format!(
            "COPY INTO {} FROM @{}/{key} \
             FILE_FORMAT = (TYPE = AVRO) MATCH_BY_COLUMN_NAME = CASE_INSENSITIVE",
            self.raw_table(mirror_name),
            self.stage_name(mirror_name),
        );
        self.client.execute(mirror_name, &copy).await?;

        Ok(())
    }

    async fn sync_via_insert(
        &self,
        mirror_name: &str,
        rows: &[RawRow],
    ) -> SluiceResult<()> {
        // Bounded chunks keep each statement within sane request sizes.
        for chunk in rows.chunks(1_000) {
            let values: Vec<String> = chunk
                .iter()
                .map(|row| {
                    format!(
                        "('{}', {}, '{}', '{}', {}, '{}', {}, '{}')",
                        escape(&row.uid),
                        row.timestamp,
                        escape(&row.destination_table_name),
                        escape(&row.data),
                        row.record_type,
                        escape(&row.match_data),
                        row.batch_id,
                        escape(&row.unchanged_toast_columns),
                    )
                })
                .collect();

            let statement = format!(
                "INSERT INTO {} VALUES {}",
                self.raw_table(mirror_name),
                values.join(", ")
            );
            self.client.execute(mirror_name, &statement).await?;
        }

        Ok(())
    }

    /// Column type shared with the merge dialect, so DDL and casts agree.
    fn column_type(kind: ValueKind) -> &'static str {
        use sluice::normalize::MergeDialect;
        SnowflakeDialect.column_type(kind)
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "''")
}

fn quote_upper(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "").to_uppercase())
}

/// Quotes a possibly schema-qualified table identifier segment by segment.
fn quote_table(identifier: &str) -> String {
    identifier
        .split('.')
        .map(quote_upper)
        .collect::<Vec<_>>()
        .join(".")
}

impl CdcSync for SnowflakeDestination {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    async fn setup_raw_table(&self, mirror_name: &str) -> SluiceResult<()> {
        self.ensure_raw_schema(mirror_name).await?;

        let create = CREATE_RAW_TABLE_SQL
            .replace("{schema}", &self.raw_schema)
            .replace("{table}", &raw_table_name(mirror_name));
        self.client.execute(mirror_name, &create).await?;

        if let Some(bucket) = &self.staging_bucket {
            let create_stage = format!(
                "CREATE STAGE IF NOT EXISTS {} URL = 's3://{bucket}/' \
                 FILE_FORMAT = (TYPE = AVRO)",
                self.stage_name(mirror_name)
            );
            self.client.execute(mirror_name, &create_stage).await?;
        }

        Ok(())
    }

    async fn sync_batch(
        &self,
        mirror_name: &str,
        batch_id: i64,
        rows: Vec<RawRow>,
    ) -> SluiceResult<()> {
        // Clear any partial landing from a failed attempt first; together
        // with the insert this makes the batch write idempotent.
        self.client
            .execute(
                mirror_name,
                &format!(
                    "DELETE FROM {} WHERE _PEERDB_BATCH_ID = {batch_id}",
                    self.raw_table(mirror_name)
                ),
            )
            .await?;

        info!(
            mirror = mirror_name,
            batch_id,
            rows = rows.len(),
            "landing raw batch in snowflake"
        );

        match &self.staging {
            Some(staging) => {
                self.sync_via_stage(staging, mirror_name, batch_id, &rows)
                    .await
            }
            None => self.sync_via_insert(mirror_name, &rows).await,
        }
    }

    async fn replay_schema_deltas(
        &self,
        mirror_name: &str,
        deltas: &[SchemaDelta],
    ) -> SluiceResult<()> {
        for delta in deltas {
            for column in &delta.added_columns {
                let statement = format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                    quote_table(&delta.destination_table),
                    quote_upper(&column.name),
                    Self::column_type(column.kind),
                );
                self.client.execute(mirror_name, &statement).await?;
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
                .execute(
                    mirror_name,
                    &format!(
                        "DELETE FROM {} WHERE _PEERDB_DESTINATION_TABLE_NAME = '{}' \
                         AND _PEERDB_BATCH_ID > {normalize_batch_id} \
                         AND _PEERDB_BATCH_ID <= {sync_batch_id}",
                        self.raw_table(mirror_name),
                        escape(table),
                    ),
                )
                .await?;
        }

        Ok(())
    }

    async fn drop_mirror_state(&self, mirror_name: &str) -> SluiceResult<()> {
        self.client
            .execute(
                mirror_name,
                &format!("DROP TABLE IF EXISTS {}", self.raw_table(mirror_name)),
            )
            .await?;
        self.client
            .execute(
                mirror_name,
                &format!("DROP STAGE IF EXISTS {}", self.stage_name(mirror_name)),
            )
            .await?;

        Ok(())
    }
}

impl CdcNormalize for SnowflakeDestination {
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

            let mut columns: Vec<String> = schema
                .columns
                .iter()
                .map(|column| {
                    let not_null = if schema.nullable_enabled && !column.nullable {
                        " NOT NULL"
                    } else {
                        ""
                    };
                    format!(
                        "{} {}{}",
                        quote_upper(&column.name),
                        Self::column_type(column.kind),
                        not_null
                    )
                })
                .collect();

            if let Some(soft_delete_col) = &request.soft_delete_col_name {
                columns.push(format!(
                    "{} BOOLEAN DEFAULT FALSE",
                    quote_upper(soft_delete_col)
                ));
            }
            if let Some(synced_at_col) = &request.synced_at_col_name {
                columns.push(format!(
                    "{} TIMESTAMP DEFAULT SYSDATE()",
                    quote_upper(synced_at_col)
                ));
            }
            if !schema.primary_key_columns.is_empty() && !schema.replica_identity_full {
                let keys: Vec<String> = schema
                    .primary_key_columns
                    .iter()
                    .map(|pk| quote_upper(pk))
                    .collect();
                columns.push(format!("PRIMARY KEY({})", keys.join(",")));
            }

            let verb = if resync {
                "CREATE OR REPLACE TABLE"
            } else {
                "CREATE TABLE IF NOT EXISTS"
            };
            let statement =
                format!("{verb} {} ({})", quote_table(&name), columns.join(", "));
            self.client.execute(&request.mirror_name, &statement).await?;
        }

        Ok(())
    }

    async fn normalize_batch(&self, request: &NormalizeRequest) -> SluiceResult<NormalizeOutcome> {
        let tables = self
            .tables_in_batch(&request.mirror_name, request.batch_id)
            .await?;
        let toast_sets = self
            .unchanged_toast_sets(&request.mirror_name, request.batch_id)
            .await?;

        let raw_table = self.raw_table(&request.mirror_name);
        let semaphore = Arc::new(Semaphore::new(request.merge_parallelism.max(1)));
        let mut join_set = JoinSet::new();

        for table in tables {
            let Some(schema) = request.table_schemas.get(&table) else {
                debug!(table = %table, "raw rows reference an unmapped table, skipping");
                continue;
            };

            let generator = MergeStatementGenerator {
                dialect: &SnowflakeDialect,
                raw_table: &raw_table,
                batch_id: request.batch_id,
                soft_delete_col_name: request.soft_delete_col_name.as_deref(),
                synced_at_col_name: request.synced_at_col_name.as_deref(),
                qualified_target: None,
            };
            let merge = generator.generate(
                &table,
                schema,
                toast_sets.get(&table).map(Vec::as_slice).unwrap_or(&[]),
            )?;

            let client = self.client.clone();
            let mirror_name = request.mirror_name.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                client.execute(&mirror_name, &merge).await?;
                Ok::<String, sluice::error::SluiceError>(table)
            });
        }

        let mut tables_merged = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(table)) => {
                    debug!(table = %table, batch_id = request.batch_id, "merged");
                    tables_merged.push(table);
                }
                Ok(Err(err)) => {
                    join_set.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    join_set.abort_all();
                    return Err(sluice_error!(
                        ErrorKind::WorkerPanic,
                        "Merge worker died",
                        join_err.to_string()
                    ));
                }
            }
        }

        Ok(NormalizeOutcome { tables_merged })
    }
}

impl QRepSync for SnowflakeDestination {
    async fn truncate_destination(&self, destination_table: &str) -> SluiceResult<()> {
        self.client
            .execute(
                "qrep",
                &format!("TRUNCATE TABLE IF EXISTS {}", quote_table(destination_table)),
            )
            .await?;
        Ok(())
    }

    async fn sync_partition(
        &self,
        mirror_name: &str,
        destination_table: &str,
        partition_id: &str,
        schema: &TableSchema,
        rows: Vec<RecordItems>,
        upsert: bool,
    ) -> SluiceResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if upsert && schema.primary_key_columns.is_empty() {
            bail!(
                ErrorKind::ValidationError,
                "Upsert requires a primary key",
                destination_table.to_string()
            );
        }

        debug!(
            table = destination_table,
            partition = partition_id,
            rows = rows.len(),
            "writing qrep partition"
        );

        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|column| quote_upper(&column.name))
            .collect();

        let mut written = 0u64;
        for chunk in rows.chunks(1_000) {
            let values: Vec<String> = chunk
                .iter()
                .map(|items| {
                    let cells: Vec<String> = schema
                        .columns
                        .iter()
                        .map(|column| sql_literal(items.get(&column.name)))
                        .collect();
                    format!("({})", cells.join(", "))
                })
                .collect();

            let statement = if upsert {
                let join: Vec<String> = schema
                    .primary_key_columns
                    .iter()
                    .map(|pk| format!("TARGET.{0} = SOURCE.{0}", quote_upper(pk)))
                    .collect();
                let assignments: Vec<String> = schema
                    .columns
                    .iter()
                    .filter(|column| !schema.primary_key_columns.contains(&column.name))
                    .map(|column| format!("TARGET.{0} = SOURCE.{0}", quote_upper(&column.name)))
                    .collect();
                let source_values: Vec<String> =
                    columns.iter().map(|c| format!("SOURCE.{c}")).collect();

                format!(
                    "MERGE INTO {table} TARGET USING (SELECT * FROM VALUES {values} \
                     AS V({columns})) SOURCE ON {join} \
                     WHEN MATCHED THEN UPDATE SET {assignments} \
                     WHEN NOT MATCHED THEN INSERT ({columns}) VALUES ({source_values})",
                    table = quote_table(destination_table),
                    values = values.join(", "),
                    columns = columns.join(", "),
                    join = join.join(" AND "),
                    assignments = assignments.join(", "),
                    source_values = source_values.join(", "),
                )
            } else {
                format!(
                    "INSERT INTO {} ({}) VALUES {}",
                    quote_table(destination_table),
                    columns.join(", "),
                    values.join(", ")
                )
            };

            self.client.execute(mirror_name, &statement).await?;
            written += chunk.len() as u64;
        }

        Ok(written)
    }
}

impl RenameTables for SnowflakeDestination {
    async fn rename_tables(
        &self,
        mirror_name: &str,
        renames: &[(String, String)],
        table_schemas: &HashMap<String, TableSchema>,
        soft_delete_col_name: Option<&str>,
    ) -> SluiceResult<()> {
        for (from, to) in renames {
            // Soft-deleted carry-over of rows missing from the resynced set.
            if let Some(soft_delete_col) = soft_delete_col_name
                && let Some(schema) = table_schemas.get(to)
                && !schema.primary_key_columns.is_empty()
            {
                let columns: Vec<String> = schema
                    .columns
                    .iter()
                    .map(|column| quote_upper(&column.name))
                    .collect();
                let keys: Vec<String> = schema
                    .primary_key_columns
                    .iter()
                    .map(|pk| quote_upper(pk))
                    .collect();

                let backfill = format!(
                    "INSERT INTO {from} ({columns}, {soft}) \
                     SELECT {columns}, true AS {soft} FROM {to} \
                     WHERE ({keys}) NOT IN (SELECT {keys} FROM {from})",
                    from = quote_table(from),
                    to = quote_table(to),
                    columns = columns.join(","),
                    soft = quote_upper(soft_delete_col),
                    keys = keys.join(","),
                );
                self.client.execute(mirror_name, &backfill).await?;
            }

            self.client
                .execute(
                    mirror_name,
                    &format!("DROP TABLE IF EXISTS {}", quote_table(to)),
                )
                .await?;
            self.client
                .execute(
                    mirror_name,
                    &format!(
                        "ALTER TABLE {} RENAME TO {}",
                        quote_table(from),
                        quote_table(to)
                    ),
                )
                .await?;
            info!(from = %from, to = %to, "renamed table");
        }

        Ok(())
    }
}

impl ValidateDestination for SnowflakeDestination {
    async fn validate_mirror_destination(
        &self,
        _table_schemas: &HashMap<String, TableSchema>,
    ) -> SluiceResult<()> {
        // Create, write and drop a scratch table to prove object privileges.
        let scratch = format!(
            "{}.SLUICE_VALIDATE_{}",
            self.raw_schema,
            uuid::Uuid::new_v4().simple()
        );

        self.ensure_raw_schema("validate").await?;
        self.client
            .execute(
                "validate",
                &format!("CREATE TABLE IF NOT EXISTS {scratch}(_SLUICE_DUMMY_COL STRING)"),
            )
            .await?;
        self.client
            .execute("validate", &format!("INSERT INTO {scratch} VALUES ('ok')"))
            .await?;
        self.client
            .execute("validate", &format!("DROP TABLE IF EXISTS {scratch}"))
            .await?;

        Ok(())
    }
}

/// Renders one value as a Snowflake SQL literal.
fn sql_literal(value: Option<&Value>) -> String {
    let Some(value) = value else {
        return "NULL".to_string();
    };

    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
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
        other => {
            let rendered = match other.to_json() {
                serde_json::Value::String(text) => text,
                json => json.to_string(),
            };
            format!("'{}'", escape(&rendered))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_table_lives_in_the_metadata_schema() {
        let create = CREATE_RAW_TABLE_SQL
            .replace("{schema}", "_PEERDB_INTERNAL")
            .replace("{table}", &raw_table_name("orders_mirror"));
        assert!(create.contains("_PEERDB_INTERNAL._PEERDB_RAW_orders_mirror"));
        assert!(create.contains("_PEERDB_UNCHANGED_TOAST_COLUMNS STRING"));
    }

    #[test]
    fn literals_escape_quotes() {
        assert_eq!(
            sql_literal(Some(&Value::String("o'brien".to_string()))),
            "'o''brien'"
        );
        assert_eq!(sql_literal(None), "NULL");
        assert_eq!(sql_literal(Some(&Value::Bool(true))), "TRUE");
    }
}
