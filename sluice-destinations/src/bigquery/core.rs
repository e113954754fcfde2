use std::collections::HashMap;
use std::sync::Arc;

use gcp_bigquery_client::Client;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::ResultSet;
use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use sluice::classifier::{ErrorSource, PeerError};
use sluice::destination::{
    CdcNormalize, CdcSync, NormalizeOutcome, NormalizeRequest, QRepSync, RenameTables,
    ValidateDestination,
};
use sluice::error::{ErrorKind, SluiceError, SluiceResult};
use sluice::normalize::{BigQueryDialect, MergeStatementGenerator};
use sluice::sluice_error;
use sluice::types::{
    RawRow, RecordItems, SchemaDelta, TableSchema, Value, ValueKind, raw_table_name,
};
use sluice_config::BigQueryConfig;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// BigQuery CDC and QRep destination.
#[derive(Clone)]
pub struct BigQueryDestination {
    client: Arc<Client>,
    project_id: String,
    dataset_id: String,
}

impl BigQueryDestination {
    pub async fn connect(config: &BigQueryConfig) -> SluiceResult<Self> {
        let key = parse_service_account_key(&config.service_account_key).map_err(|err| {
            sluice_error!(
                ErrorKind::ConfigError,
                "Invalid BigQuery service account key",
                err.to_string()
            )
        })?;

        let client = Client::from_service_account_key(key, false)
            .await
            .map_err(|err| bq_error("connect", err))?;

        Ok(Self {
            client: Arc::new(client),
            project_id: config.project_id.clone(),
            dataset_id: config.dataset_id.clone(),
        })
    }

    fn qualified(&self, table: &str) -> String {
        format!(
            "`{}.{}.{}`",
            self.project_id,
            self.dataset_id,
            table.replace('`', "")
        )
    }

    fn raw_table(&self, mirror_name: &str) -> String {
        self.qualified(&raw_table_name(mirror_name))
    }

    async fn execute(&self, sql: &str) -> SluiceResult<ResultSet> {
        debug!(sql, "executing bigquery statement");

        let response = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await
            .map_err(|err| bq_error("query", err))?;

        Ok(ResultSet::new_from_query_response(response))
    }

    fn column_type(kind: ValueKind) -> &'static str {
        use sluice::normalize::MergeDialect;
        BigQueryDialect.column_type(kind)
    }
}

fn bq_error(operation: &str, err: gcp_bigquery_client::error::BQError) -> SluiceError {
    let message = err.to_string();
    sluice_error!(
        ErrorKind::QueryFailed,
        "BigQuery operation failed",
        format!("{operation}: {message}")
    )
    .with_source(PeerError::new(ErrorSource::BigQuery, "UNKNOWN", message))
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "\\'")
}

impl CdcSync for BigQueryDestination {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn setup_raw_table(&self, mirror_name: &str) -> SluiceResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             _PEERDB_UID STRING, _PEERDB_TIMESTAMP INT64, \
             _PEERDB_DESTINATION_TABLE_NAME STRING, _PEERDB_DATA STRING, \
             _PEERDB_RECORD_TYPE INT64, _PEERDB_MATCH_DATA STRING, \
             _PEERDB_BATCH_ID INT64, _PEERDB_UNCHANGED_TOAST_COLUMNS STRING)",
            self.raw_table(mirror_name)
        );
        self.execute(&sql).await?;
        Ok(())
    }

    async fn sync_batch(
        &self,
        mirror_name: &str,
        batch_id: i64,
        rows: Vec<RawRow>,
    ) -> SluiceResult<()> {
        let raw_table = self.raw_table(mirror_name);

        // Clearing the batch first makes the landing idempotent on retry.
        self.execute(&format!(
            "DELETE FROM {raw_table} WHERE _PEERDB_BATCH_ID = {batch_id}"
        ))
        .await?;

        info!(
            mirror = mirror_name,
            batch_id,
            rows = rows.len(),
            "landing raw batch in bigquery"
        );

        for chunk in rows.chunks(500) {
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

            self.execute(&format!(
                "INSERT INTO {raw_table} VALUES {}",
                values.join(", ")
            ))
            .await?;
        }

        Ok(())
    }

    async fn replay_schema_deltas(
        &self,
        _mirror_name: &str,
        deltas: &[SchemaDelta],
    ) -> SluiceResult<()> {
        for delta in deltas {
            for column in &delta.added_columns {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS `{}` {}",
                    self.qualified(&delta.destination_table),
                    column.name.replace('`', ""),
                    Self::column_type(column.kind),
                );
                self.execute(&sql).await?;
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
            self.execute(&format!(
                "DELETE FROM {} WHERE _PEERDB_DESTINATION_TABLE_NAME = '{}' \
                 AND _PEERDB_BATCH_ID > {normalize_batch_id} \
                 AND _PEERDB_BATCH_ID <= {sync_batch_id}",
                self.raw_table(mirror_name),
                escape(table),
            ))
            .await?;
        }

        Ok(())
    }

    async fn drop_mirror_state(&self, mirror_name: &str) -> SluiceResult<()> {
        self.execute(&format!(
            "DROP TABLE IF EXISTS {}",
            self.raw_table(mirror_name)
        ))
        .await?;
        Ok(())
    }
}

impl CdcNormalize for BigQueryDestination {
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
                    format!(
                        "`{}` {}",
                        column.name.replace('`', ""),
                        Self::column_type(column.kind)
                    )
                })
                .collect();
            if let Some(soft_delete_col) = &request.soft_delete_col_name {
                columns.push(format!("`{soft_delete_col}` BOOL DEFAULT FALSE"));
            }
            if let Some(synced_at_col) = &request.synced_at_col_name {
                columns.push(format!(
                    "`{synced_at_col}` TIMESTAMP DEFAULT CURRENT_TIMESTAMP()"
                ));
            }

            let verb = if resync {
                "CREATE OR REPLACE TABLE"
            } else {
                "CREATE TABLE IF NOT EXISTS"
            };
            self.execute(&format!(
                "{verb} {} ({})",
                self.qualified(&name),
                columns.join(", ")
            ))
            .await?;
        }

        Ok(())
    }

    async fn normalize_batch(&self, request: &NormalizeRequest) -> SluiceResult<NormalizeOutcome> {
        let raw_table = self.raw_table(&request.mirror_name);

        let mut tables = Vec::new();
        let mut result_set = self
            .execute(&format!(
                "SELECT DISTINCT _PEERDB_DESTINATION_TABLE_NAME FROM {raw_table} \
                 WHERE _PEERDB_BATCH_ID = {}",
                request.batch_id
            ))
            .await?;
        while result_set.next_row() {
            if let Ok(Some(table)) = result_set.get_string(0) {
                tables.push(table);
            }
        }

        let mut toast_sets: HashMap<String, Vec<String>> = HashMap::new();
        let mut result_set = self
            .execute(&format!(
                "SELECT _PEERDB_DESTINATION_TABLE_NAME, _PEERDB_UNCHANGED_TOAST_COLUMNS \
                 FROM {raw_table} WHERE _PEERDB_BATCH_ID = {} AND _PEERDB_RECORD_TYPE != 2 \
                 GROUP BY 1, 2",
                request.batch_id
            ))
            .await?;
        while result_set.next_row() {
            if let Ok(Some(table)) = result_set.get_string(0) {
                let set = result_set.get_string(1).ok().flatten().unwrap_or_default();
                toast_sets.entry(table).or_default().push(set);
            }
        }

        let semaphore = Arc::new(Semaphore::new(request.merge_parallelism.max(1)));
        let mut join_set = JoinSet::new();

        for table in tables {
            let Some(schema) = request.table_schemas.get(&table) else {
                debug!(table = %table, "raw rows reference an unmapped table, skipping");
                continue;
            };

            let qualified_target = self.qualified(&table);
            let generator = MergeStatementGenerator {
                dialect: &BigQueryDialect,
                raw_table: &raw_table,
                batch_id: request.batch_id,
                soft_delete_col_name: request.soft_delete_col_name.as_deref(),
                synced_at_col_name: request.synced_at_col_name.as_deref(),
                qualified_target: Some(&qualified_target),
            };
            let merge = generator.generate(
                &table,
                schema,
                toast_sets.get(&table).map(Vec::as_slice).unwrap_or(&[]),
            )?;

            let destination = self.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                destination.execute(&merge).await?;
                Ok::<String, SluiceError>(table)
            });
        }

        let mut tables_merged = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(table)) => tables_merged.push(table),
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

impl QRepSync for BigQueryDestination {
    async fn truncate_destination(&self, destination_table: &str) -> SluiceResult<()> {
        self.execute(&format!(
            "TRUNCATE TABLE {}",
            self.qualified(destination_table)
        ))
        .await?;
        Ok(())
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

        debug!(
            table = destination_table,
            partition = partition_id,
            rows = rows.len(),
            "writing qrep partition"
        );

        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|column| format!("`{}`", column.name.replace('`', "")))
            .collect();

        let mut written = 0u64;
        for chunk in rows.chunks(500) {
            let values: Vec<String> = chunk
                .iter()
                .map(|items| {
                    let cells: Vec<String> = schema
                        .columns
                        .iter()
                        .map(|column| literal(items.get(&column.name)))
                        .collect();
                    format!("({})", cells.join(", "))
                })
                .collect();

            self.execute(&format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.qualified(destination_table),
                columns.join(", "),
                values.join(", ")
            ))
            .await?;
            written += chunk.len() as u64;
        }

        Ok(written)
    }
}

impl RenameTables for BigQueryDestination {
    async fn rename_tables(
        &self,
        _mirror_name: &str,
        renames: &[(String, String)],
        table_schemas: &HashMap<String, TableSchema>,
        soft_delete_col_name: Option<&str>,
    ) -> SluiceResult<()> {
        for (from, to) in renames {
            if let Some(soft_delete_col) = soft_delete_col_name
                && let Some(schema) = table_schemas.get(to)
                && !schema.primary_key_columns.is_empty()
            {
                let columns: Vec<String> = schema
                    .columns
                    .iter()
                    .map(|column| format!("`{}`", column.name.replace('`', "")))
                    .collect();
                let keys: Vec<String> = schema
                    .primary_key_columns
                    .iter()
                    .map(|pk| format!("`{pk}`"))
                    .collect();

                self.execute(&format!(
                    "INSERT INTO {from} ({columns}, `{soft}`) \
                     SELECT {columns}, TRUE FROM {to} t \
                     WHERE NOT EXISTS (SELECT 1 FROM {from} r WHERE {join})",
                    from = self.qualified(from),
                    to = self.qualified(to),
                    columns = columns.join(", "),
                    soft = soft_delete_col,
                    join = keys
                        .iter()
                        .map(|k| format!("r.{k} = t.{k}"))
                        .collect::<Vec<_>>()
                        .join(" AND "),
                ))
                .await?;
            }

            self.execute(&format!(
                "DROP TABLE IF EXISTS {}",
                self.qualified(to)
            ))
            .await?;
            self.execute(&format!(
                "ALTER TABLE {} RENAME TO `{}`",
                self.qualified(from),
                to.replace('`', "")
            ))
            .await?;
            info!(from = %from, to = %to, "renamed table");
        }

        Ok(())
    }
}

impl ValidateDestination for BigQueryDestination {
    async fn validate_mirror_destination(
        &self,
        _table_schemas: &HashMap<String, TableSchema>,
    ) -> SluiceResult<()> {
        self.execute("SELECT 1").await?;
        Ok(())
    }
}

/// Renders one value as a BigQuery SQL literal.
fn literal(value: Option<&Value>) -> String {
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
    fn literals_render_bigquery_shapes() {
        assert_eq!(literal(Some(&Value::Bool(false))), "FALSE");
        assert_eq!(
            literal(Some(&Value::String("a\\'b".to_string()))),
            "'a\\\\\\'b'"
        );
        assert_eq!(literal(None), "NULL");
    }
}
