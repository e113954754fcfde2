use std::collections::BTreeSet;

use crate::bail;
use crate::error::{ErrorKind, SluiceResult};
use crate::types::{ColumnSchema, TableSchema, ValueKind};

/// Destination-specific SQL spellings the generator needs.
///
/// Dialects stay tiny on purpose: everything structural about the merge is
/// shared, only quoting, JSON projection and type names differ.
pub trait MergeDialect: Send + Sync {
    /// Quotes an identifier for this destination.
    fn quote_identifier(&self, identifier: &str) -> String;

    /// SQL type a value kind maps to, both for casts and DDL.
    fn column_type(&self, kind: ValueKind) -> &'static str;

    /// Expression converting the raw `_PEERDB_DATA` string into the variant
    /// the projection reads from.
    fn parse_json_expression(&self, data_column: &str) -> String;

    /// Expression projecting `column` out of the parsed variant with a cast.
    fn project_column(&self, variant_column: &str, column: &ColumnSchema) -> String;

    /// Expression producing the current timestamp for `_peerdb_synced_at`.
    fn current_timestamp(&self) -> &'static str;
}

/// Snowflake spelling of the merge.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnowflakeDialect;

impl MergeDialect for SnowflakeDialect {
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\"").to_uppercase())
    }

    fn column_type(&self, kind: ValueKind) -> &'static str {
        match kind {
            ValueKind::Bool => "BOOLEAN",
            ValueKind::Int8 | ValueKind::Int16 | ValueKind::Int32 | ValueKind::Int64 => "INTEGER",
            ValueKind::UInt8 | ValueKind::UInt16 | ValueKind::UInt32 | ValueKind::UInt64 => {
                "INTEGER"
            }
            ValueKind::Float32 | ValueKind::Float64 => "FLOAT",
            ValueKind::String => "STRING",
            ValueKind::Bytes => "BINARY",
            ValueKind::Uuid => "STRING",
            ValueKind::Numeric => "NUMBER(38,20)",
            ValueKind::Timestamp => "TIMESTAMP_NTZ",
            ValueKind::TimestampTz => "TIMESTAMP_TZ",
            ValueKind::Time => "TIME",
            ValueKind::Date => "DATE",
            ValueKind::Json => "VARIANT",
            ValueKind::Array => "VARIANT",
        }
    }

    fn parse_json_expression(&self, data_column: &str) -> String {
        format!("TO_VARIANT(PARSE_JSON({data_column}))")
    }

    fn project_column(&self, variant_column: &str, column: &ColumnSchema) -> String {
        let quoted = self.quote_identifier(&column.name);
        match column.kind {
            // Variant columns keep their JSON shape instead of casting.
            ValueKind::Json | ValueKind::Array => {
                format!("{variant_column}:\"{}\" AS {quoted}", column.name)
            }
            ValueKind::Bytes => format!(
                "TO_BINARY({variant_column}:\"{}\"::STRING, 'HEX') AS {quoted}",
                column.name
            ),
            _ => format!(
                "CAST({variant_column}:\"{}\" AS {}) AS {quoted}",
                column.name,
                self.column_type(column.kind)
            ),
        }
    }

    fn current_timestamp(&self) -> &'static str {
        "SYSDATE()"
    }
}

/// BigQuery spelling of the merge.
#[derive(Clone, Copy, Debug, Default)]
pub struct BigQueryDialect;

impl MergeDialect for BigQueryDialect {
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("`{}`", identifier.replace('`', ""))
    }

    fn column_type(&self, kind: ValueKind) -> &'static str {
        match kind {
            ValueKind::Bool => "BOOL",
            ValueKind::Int8 | ValueKind::Int16 | ValueKind::Int32 | ValueKind::Int64 => "INT64",
            ValueKind::UInt8 | ValueKind::UInt16 | ValueKind::UInt32 | ValueKind::UInt64 => {
                "INT64"
            }
            ValueKind::Float32 | ValueKind::Float64 => "FLOAT64",
            ValueKind::String => "STRING",
            ValueKind::Bytes => "BYTES",
            ValueKind::Uuid => "STRING",
            ValueKind::Numeric => "BIGNUMERIC",
            ValueKind::Timestamp => "DATETIME",
            ValueKind::TimestampTz => "TIMESTAMP",
            ValueKind::Time => "TIME",
            ValueKind::Date => "DATE",
            ValueKind::Json => "JSON",
            ValueKind::Array => "JSON",
        }
    }

    fn parse_json_expression(&self, data_column: &str) -> String {
        format!("PARSE_JSON({data_column}, wide_number_mode=>'round')")
    }

    fn project_column(&self, variant_column: &str, column: &ColumnSchema) -> String {
        let quoted = self.quote_identifier(&column.name);
        match column.kind {
            ValueKind::Json | ValueKind::Array => format!(
                "JSON_QUERY({variant_column}, '$.{}') AS {quoted}",
                column.name
            ),
            ValueKind::Bytes => format!(
                "FROM_HEX(LTRIM(JSON_VALUE({variant_column}, '$.{}'), '\\\\x')) AS {quoted}",
                column.name
            ),
            _ => format!(
                "CAST(JSON_VALUE({variant_column}, '$.{}') AS {}) AS {quoted}",
                column.name,
                self.column_type(column.kind)
            ),
        }
    }

    fn current_timestamp(&self) -> &'static str {
        "CURRENT_TIMESTAMP()"
    }
}

/// Generates one MERGE statement per `(batch, destination table)`.
pub struct MergeStatementGenerator<'a, D> {
    pub dialect: &'a D,
    /// Fully qualified raw table, already quoted for the destination.
    pub raw_table: &'a str,
    pub batch_id: i64,
    pub soft_delete_col_name: Option<&'a str>,
    pub synced_at_col_name: Option<&'a str>,
    /// Pre-qualified merge target (e.g. `` `project.dataset.table` ``). When
    /// absent, the destination identifier is quoted segment by segment.
    pub qualified_target: Option<&'a str>,
}

impl<'a, D: MergeDialect> MergeStatementGenerator<'a, D> {
    /// Builds the merge for `schema`, with one matched-update branch per
    /// distinct unchanged-TOAST set in `unchanged_toast_sets`.
    ///
    /// `unchanged_toast_sets` are the distinct `_PEERDB_UNCHANGED_TOAST_COLUMNS`
    /// values observed for this table and batch among non-delete rows; the
    /// empty string (all columns present) is added if missing.
    pub fn generate(
        &self,
        destination_table: &str,
        schema: &TableSchema,
        unchanged_toast_sets: &[String],
    ) -> SluiceResult<String> {
        let identity_columns = schema.identity_columns();
        if identity_columns.is_empty() {
            bail!(
                ErrorKind::ValidationError,
                "Cannot merge a table without row identity",
                format!(
                    "table '{}' has no primary key and no full replica identity",
                    schema.name
                )
            );
        }

        let dialect = self.dialect;
        let quoted_destination = match self.qualified_target {
            Some(target) => target.to_string(),
            // Dotted identifiers quote per segment: schema.table stays two
            // identifiers, not one containing a dot.
            None => destination_table
                .split('.')
                .map(|segment| dialect.quote_identifier(segment))
                .collect::<Vec<_>>()
                .join("."),
        };

        let projections: Vec<String> = schema
            .columns
            .iter()
            .map(|column| dialect.project_column("VAR_COLS", column))
            .collect();

        let rank_partition: Vec<String> = identity_columns
            .iter()
            .map(|column| dialect.quote_identifier(column))
            .collect();

        let join_predicate: Vec<String> = identity_columns
            .iter()
            .map(|column| {
                let quoted = dialect.quote_identifier(column);
                format!("TARGET.{quoted} = SOURCE.{quoted}")
            })
            .collect();

        let mut insert_columns: Vec<String> = schema
            .columns
            .iter()
            .map(|column| dialect.quote_identifier(&column.name))
            .collect();
        let mut insert_values: Vec<String> = schema
            .columns
            .iter()
            .map(|column| format!("SOURCE.{}", dialect.quote_identifier(&column.name)))
            .collect();

        if let Some(soft_delete_col) = self.soft_delete_col_name {
            insert_columns.push(dialect.quote_identifier(soft_delete_col));
            insert_values.push("FALSE".to_string());
        }
        if let Some(synced_at_col) = self.synced_at_col_name {
            insert_columns.push(dialect.quote_identifier(synced_at_col));
            insert_values.push(dialect.current_timestamp().to_string());
        }

        let update_branches = self.update_branches(schema, unchanged_toast_sets);
        let delete_branch = self.delete_branch();

        // With soft deletes, a row deleted before it ever reached the
        // destination (insert and delete landing in one batch) still lands,
        // flagged; its values come from the delete's row image. The flag
        // column sits right after the data columns in the insert list.
        let soft_delete_insert_branch = if self.soft_delete_col_name.is_some() {
            let mut values = insert_values.clone();
            values[schema.columns.len()] = "TRUE".to_string();
            format!(
                "WHEN NOT MATCHED AND (SOURCE._PEERDB_RECORD_TYPE = 2) THEN \
                 INSERT ({columns}) VALUES ({values}) ",
                columns = insert_columns.join(", "),
                values = values.join(", "),
            )
        } else {
            String::new()
        };

        let statement = format!(
            "MERGE INTO {destination} TARGET USING (\
             WITH VARIANT_CONVERTED AS (\
             SELECT _PEERDB_UID, _PEERDB_TIMESTAMP, {parse_json} VAR_COLS, _PEERDB_RECORD_TYPE, \
             _PEERDB_MATCH_DATA, _PEERDB_BATCH_ID, _PEERDB_UNCHANGED_TOAST_COLUMNS \
             FROM {raw_table} \
             WHERE _PEERDB_BATCH_ID = {batch_id} AND _PEERDB_DATA != '' \
             AND _PEERDB_DESTINATION_TABLE_NAME = '{destination_name}'), \
             FLATTENED AS (\
             SELECT _PEERDB_UID, _PEERDB_TIMESTAMP, _PEERDB_RECORD_TYPE, _PEERDB_MATCH_DATA, \
             _PEERDB_BATCH_ID, _PEERDB_UNCHANGED_TOAST_COLUMNS, {projections} \
             FROM VARIANT_CONVERTED), \
             DEDUPLICATED_FLATTENED AS (\
             SELECT _PEERDB_RANKED.* FROM (\
             SELECT RANK() OVER (\
             PARTITION BY {rank_partition} \
             ORDER BY _PEERDB_TIMESTAMP DESC, _PEERDB_UID DESC) AS _PEERDB_RANK, * \
             FROM FLATTENED) _PEERDB_RANKED \
             WHERE _PEERDB_RANK = 1) \
             SELECT * FROM DEDUPLICATED_FLATTENED) SOURCE \
             ON {join_predicate} \
             WHEN NOT MATCHED AND (SOURCE._PEERDB_RECORD_TYPE != 2) THEN \
             INSERT ({insert_columns}) VALUES ({insert_values}) \
             {soft_delete_insert_branch}\
             {update_branches} \
             WHEN MATCHED AND (SOURCE._PEERDB_RECORD_TYPE = 2) THEN {delete_branch}",
            destination = quoted_destination,
            parse_json = dialect.parse_json_expression("_PEERDB_DATA"),
            raw_table = self.raw_table,
            batch_id = self.batch_id,
            destination_name = destination_table.replace('\'', "''"),
            projections = projections.join(", "),
            rank_partition = rank_partition.join(", "),
            join_predicate = join_predicate.join(" AND "),
            insert_columns = insert_columns.join(", "),
            insert_values = insert_values.join(", "),
            soft_delete_insert_branch = soft_delete_insert_branch,
            update_branches = update_branches,
            delete_branch = delete_branch,
        );

        Ok(statement)
    }

    /// One `WHEN MATCHED` update branch per distinct unchanged-TOAST set.
    ///
    /// The columns named by a set are excluded from that branch's SET clause,
    /// which is what preserves their destination values.
    fn update_branches(&self, schema: &TableSchema, unchanged_toast_sets: &[String]) -> String {
        let dialect = self.dialect;

        let mut sets: BTreeSet<&str> = unchanged_toast_sets
            .iter()
            .map(|set| set.as_str())
            .collect();
        sets.insert("");

        let mut branches = Vec::with_capacity(sets.len());
        for set in sets {
            let excluded: BTreeSet<&str> = if set.is_empty() {
                BTreeSet::new()
            } else {
                set.split(',').collect()
            };

            let mut assignments: Vec<String> = schema
                .columns
                .iter()
                .filter(|column| !excluded.contains(column.name.as_str()))
                .map(|column| {
                    let quoted = dialect.quote_identifier(&column.name);
                    format!("TARGET.{quoted} = SOURCE.{quoted}")
                })
                .collect();

            if let Some(synced_at_col) = self.synced_at_col_name {
                assignments.push(format!(
                    "TARGET.{} = {}",
                    dialect.quote_identifier(synced_at_col),
                    dialect.current_timestamp()
                ));
            }
            if let Some(soft_delete_col) = self.soft_delete_col_name {
                // An update resurrects a soft-deleted row.
                assignments.push(format!(
                    "TARGET.{} = FALSE",
                    dialect.quote_identifier(soft_delete_col)
                ));
            }

            branches.push(format!(
                "WHEN MATCHED AND (SOURCE._PEERDB_RECORD_TYPE != 2) \
                 AND _PEERDB_UNCHANGED_TOAST_COLUMNS = '{set}' THEN \
                 UPDATE SET {assignments}",
                assignments = assignments.join(", "),
            ));
        }

        branches.join(" ")
    }

    /// Deletes apply regardless of the record's unchanged-TOAST set.
    fn delete_branch(&self) -> String {
        let dialect = self.dialect;

        match self.soft_delete_col_name {
            Some(soft_delete_col) => {
                let mut assignments = vec![format!(
                    "TARGET.{} = TRUE",
                    dialect.quote_identifier(soft_delete_col)
                )];
                if let Some(synced_at_col) = self.synced_at_col_name {
                    assignments.push(format!(
                        "TARGET.{} = {}",
                        dialect.quote_identifier(synced_at_col),
                        dialect.current_timestamp()
                    ));
                }
                format!("UPDATE SET {}", assignments.join(", "))
            }
            None => "DELETE".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnSchema;

    fn orders_schema() -> TableSchema {
        TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", ValueKind::Int64, -1, false),
                ColumnSchema::new("total", ValueKind::Numeric, -1, true),
                ColumnSchema::new("description", ValueKind::String, -1, true),
            ],
            vec!["id".to_string()],
        )
    }

    fn generator(soft_delete: bool) -> MergeStatementGenerator<'static, SnowflakeDialect> {
        static DIALECT: SnowflakeDialect = SnowflakeDialect;
        MergeStatementGenerator {
            dialect: &DIALECT,
            raw_table: "_PEERDB_INTERNAL._PEERDB_RAW_orders_mirror",
            batch_id: 7,
            soft_delete_col_name: soft_delete.then_some("_peerdb_is_deleted"),
            synced_at_col_name: Some("_peerdb_synced_at"),
            qualified_target: None,
        }
    }

    #[test]
    fn merge_filters_on_batch_and_table() {
        let sql = generator(false)
            .generate("orders", &orders_schema(), &[])
            .unwrap();
        assert!(sql.contains("_PEERDB_BATCH_ID = 7"));
        assert!(sql.contains("_PEERDB_DESTINATION_TABLE_NAME = 'orders'"));
        assert!(sql.contains("_PEERDB_DATA != ''"));
    }

    #[test]
    fn dedup_orders_by_timestamp_then_uid() {
        let sql = generator(false)
            .generate("orders", &orders_schema(), &[])
            .unwrap();
        assert!(sql.contains("ORDER BY _PEERDB_TIMESTAMP DESC, _PEERDB_UID DESC"));
        assert!(sql.contains("PARTITION BY \"ID\""));
        assert!(sql.contains("WHERE _PEERDB_RANK = 1"));
    }

    #[test]
    fn one_update_branch_per_toast_set_excluding_columns() {
        let sql = generator(false)
            .generate(
                "orders",
                &orders_schema(),
                &["description".to_string(), String::new()],
            )
            .unwrap();

        // The empty set updates everything.
        assert!(sql.contains("_PEERDB_UNCHANGED_TOAST_COLUMNS = '' THEN"));
        // The description-set branch must not assign to DESCRIPTION.
        let branch_start = sql
            .find("_PEERDB_UNCHANGED_TOAST_COLUMNS = 'description'")
            .expect("toast branch missing");
        let branch = &sql[branch_start..]
            [..sql[branch_start..].find("WHEN MATCHED AND (SOURCE._PEERDB_RECORD_TYPE = 2)").unwrap()];
        assert!(!branch.contains("TARGET.\"DESCRIPTION\" = SOURCE"));
        assert!(branch.contains("TARGET.\"TOTAL\" = SOURCE.\"TOTAL\""));
    }

    #[test]
    fn hard_delete_removes_row() {
        let sql = generator(false)
            .generate("orders", &orders_schema(), &[])
            .unwrap();
        assert!(sql.ends_with("WHEN MATCHED AND (SOURCE._PEERDB_RECORD_TYPE = 2) THEN DELETE"));
    }

    #[test]
    fn soft_delete_sets_flag_instead() {
        let sql = generator(true)
            .generate("orders", &orders_schema(), &[])
            .unwrap();
        assert!(sql.contains(
            "WHEN MATCHED AND (SOURCE._PEERDB_RECORD_TYPE = 2) THEN UPDATE SET \
             TARGET.\"_PEERDB_IS_DELETED\" = TRUE"
        ));
        // Updates resurrect soft-deleted rows.
        assert!(sql.contains("TARGET.\"_PEERDB_IS_DELETED\" = FALSE"));
        // A delete whose row never reached the destination still lands,
        // flagged, carrying the delete's row image.
        assert!(sql.contains(
            "WHEN NOT MATCHED AND (SOURCE._PEERDB_RECORD_TYPE = 2) THEN INSERT"
        ));
        let not_matched_delete = sql
            .split("WHEN NOT MATCHED AND (SOURCE._PEERDB_RECORD_TYPE = 2) THEN INSERT")
            .nth(1)
            .unwrap();
        assert!(not_matched_delete.contains("TRUE"));
    }

    #[test]
    fn hard_delete_has_no_not_matched_delete_branch() {
        let sql = generator(false)
            .generate("orders", &orders_schema(), &[])
            .unwrap();
        assert!(!sql.contains("WHEN NOT MATCHED AND (SOURCE._PEERDB_RECORD_TYPE = 2)"));
    }

    #[test]
    fn tables_without_identity_are_rejected() {
        let schema = TableSchema::new(
            "logs",
            vec![ColumnSchema::new("line", ValueKind::String, -1, true)],
            vec![],
        );
        assert!(generator(false).generate("logs", &schema, &[]).is_err());
    }

    #[test]
    fn bigquery_dialect_projects_with_json_value() {
        static DIALECT: BigQueryDialect = BigQueryDialect;
        let generator = MergeStatementGenerator {
            dialect: &DIALECT,
            raw_table: "`project.dataset._PEERDB_RAW_m`",
            batch_id: 1,
            soft_delete_col_name: None,
            synced_at_col_name: None,
            qualified_target: Some("`project.dataset.orders`"),
        };
        let sql = generator.generate("orders", &orders_schema(), &[]).unwrap();
        assert!(sql.starts_with("MERGE INTO `project.dataset.orders` TARGET"));
        // The raw filter keeps the bare destination identifier.
        assert!(sql.contains("_PEERDB_DESTINATION_TABLE_NAME = 'orders'"));
        assert!(sql.contains("JSON_VALUE(VAR_COLS, '$.id')"));
        assert!(sql.contains("CAST(JSON_VALUE(VAR_COLS, '$.total') AS BIGNUMERIC)"));
    }

    #[test]
    fn dotted_destination_identifiers_quote_per_segment() {
        let sql = generator(false)
            .generate("analytics.orders", &orders_schema(), &[])
            .unwrap();
        assert!(sql.starts_with("MERGE INTO \"ANALYTICS\".\"ORDERS\" TARGET"));
        assert!(sql.contains("_PEERDB_DESTINATION_TABLE_NAME = 'analytics.orders'"));
    }
}
