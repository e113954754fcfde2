//! Core data model: values, change records, schemas and cursors.

mod record;
mod schema;
mod value;

pub use record::{
    ChangeMeta, ChangeRecord, Checkpoint, RawRow, RecordItems, RecordType, BatchCursor,
};
pub use schema::{AddedColumn, ColumnSchema, SchemaDelta, TableSchema};
pub use value::{Value, ValueKind};

/// Name of the soft-delete marker column added to normalized tables.
pub const SOFT_DELETE_COLUMN: &str = "_peerdb_is_deleted";

/// Name of the synced-at column added to normalized tables.
pub const SYNCED_AT_COLUMN: &str = "_peerdb_synced_at";

/// Returns the destination-side raw table name for a mirror.
///
/// Characters outside `[A-Za-z0-9_]` are replaced with underscores so the
/// result is a legal unquoted identifier everywhere.
pub fn raw_table_name(mirror_name: &str) -> String {
    let sanitized: String = mirror_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    format!("_PEERDB_RAW_{sanitized}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_table_name_sanitizes_identifier() {
        assert_eq!(raw_table_name("orders-to-ch"), "_PEERDB_RAW_orders_to_ch");
        assert_eq!(raw_table_name("simple"), "_PEERDB_RAW_simple");
    }
}
