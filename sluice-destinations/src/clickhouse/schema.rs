use sluice::types::{TableSchema, ValueKind, raw_table_name};

/// Version column driving ReplacingMergeTree deduplication.
pub const VERSION_COLUMN: &str = "_peerdb_version";

pub fn quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', ""))
}

/// ClickHouse column type for an engine value kind.
pub fn column_type(kind: ValueKind, nullable: bool) -> String {
    let base = match kind {
        ValueKind::Bool => "Bool",
        ValueKind::Int8 => "Int8",
        ValueKind::Int16 => "Int16",
        ValueKind::Int32 => "Int32",
        ValueKind::Int64 => "Int64",
        ValueKind::UInt8 => "UInt8",
        ValueKind::UInt16 => "UInt16",
        ValueKind::UInt32 => "UInt32",
        ValueKind::UInt64 => "UInt64",
        ValueKind::Float32 => "Float32",
        ValueKind::Float64 => "Float64",
        ValueKind::String | ValueKind::Uuid | ValueKind::Json | ValueKind::Array => "String",
        ValueKind::Bytes => "String",
        ValueKind::Numeric => "Decimal(76, 20)",
        ValueKind::Timestamp | ValueKind::TimestampTz => "DateTime64(6)",
        ValueKind::Time => "String",
        ValueKind::Date => "Date32",
    };

    if nullable {
        format!("Nullable({base})")
    } else {
        base.to_string()
    }
}

/// DDL for the raw landing table of a mirror.
pub fn create_raw_table_sql(mirror_name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         _peerdb_uid String, \
         _peerdb_timestamp Int64, \
         _peerdb_destination_table_name String, \
         _peerdb_data String, \
         _peerdb_record_type Int16, \
         _peerdb_match_data String, \
         _peerdb_batch_id Int64, \
         _peerdb_unchanged_toast_columns String) \
         ENGINE = MergeTree() ORDER BY (_peerdb_batch_id, _peerdb_destination_table_name)",
        quote(&raw_table_name(mirror_name))
    )
}

/// DDL for one normalized table.
///
/// Uses ReplacingMergeTree keyed on the version column so that re-merged
/// batches converge instead of duplicating rows. Primary-key columns are
/// stored non-nullable because they form the ORDER BY key.
pub fn create_normalized_table_sql(
    table_name: &str,
    schema: &TableSchema,
    soft_delete_col: Option<&str>,
    synced_at_col: Option<&str>,
    engine_override: Option<&str>,
) -> String {
    let mut columns: Vec<String> = schema
        .columns
        .iter()
        .map(|column| {
            let nullable = column.nullable && !schema.primary_key_columns.contains(&column.name);
            format!(
                "{} {}",
                quote(&column.name),
                column_type(column.kind, nullable)
            )
        })
        .collect();

    if let Some(soft_delete_col) = soft_delete_col {
        columns.push(format!("{} Bool DEFAULT false", quote(soft_delete_col)));
    }
    if let Some(synced_at_col) = synced_at_col {
        columns.push(format!(
            "{} DateTime64(6) DEFAULT now64()",
            quote(synced_at_col)
        ));
    }
    columns.push(format!("{} Int64", quote(VERSION_COLUMN)));

    let order_by: Vec<String> = if schema.primary_key_columns.is_empty() {
        vec!["tuple()".to_string()]
    } else {
        schema
            .primary_key_columns
            .iter()
            .map(|column| quote(column))
            .collect()
    };

    let engine = engine_override
        .map(str::to_string)
        .unwrap_or_else(|| format!("ReplacingMergeTree({})", quote(VERSION_COLUMN)));

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = {} ORDER BY ({})",
        quote(table_name),
        columns.join(", "),
        engine,
        order_by.join(", ")
    )
}

/// JSON projection expression for one column of `_peerdb_data`.
pub fn json_extract_expression(column_name: &str, kind: ValueKind, nullable: bool) -> String {
    let target_type = column_type(kind, nullable);
    match kind {
        // JSON-shaped columns come through as their raw text.
        ValueKind::Json | ValueKind::Array => {
            format!("JSONExtractRaw(_peerdb_data, '{column_name}')")
        }
        _ => format!("JSONExtract(_peerdb_data, '{column_name}', '{target_type}')"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice::types::ColumnSchema;

    fn schema() -> TableSchema {
        TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", ValueKind::Int64, -1, false),
                ColumnSchema::new("total", ValueKind::Numeric, -1, true),
            ],
            vec!["id".to_string()],
        )
    }

    #[test]
    fn raw_table_ddl_matches_the_raw_layout() {
        let sql = create_raw_table_sql("orders_mirror");
        assert!(sql.contains("`_PEERDB_RAW_orders_mirror`"));
        for column in [
            "_peerdb_uid",
            "_peerdb_timestamp",
            "_peerdb_destination_table_name",
            "_peerdb_data",
            "_peerdb_record_type",
            "_peerdb_match_data",
            "_peerdb_batch_id",
            "_peerdb_unchanged_toast_columns",
        ] {
            assert!(sql.contains(column), "missing {column}");
        }
    }

    #[test]
    fn normalized_ddl_adds_meta_columns_and_version() {
        let sql = create_normalized_table_sql(
            "orders",
            &schema(),
            Some("_peerdb_is_deleted"),
            Some("_peerdb_synced_at"),
            None,
        );
        assert!(sql.contains("`_peerdb_is_deleted` Bool DEFAULT false"));
        assert!(sql.contains("`_peerdb_synced_at` DateTime64(6) DEFAULT now64()"));
        assert!(sql.contains("ReplacingMergeTree(`_peerdb_version`)"));
        assert!(sql.contains("ORDER BY (`id`)"));
        // Nullable only off the primary key.
        assert!(sql.contains("`total` Nullable(Decimal(76, 20))"));
        assert!(sql.contains("`id` Int64"));
    }

    #[test]
    fn engine_override_is_respected() {
        let sql = create_normalized_table_sql("orders", &schema(), None, None, Some("MergeTree()"));
        assert!(sql.contains("ENGINE = MergeTree()"));
    }
}
