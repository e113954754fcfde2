use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::schema::TableSchema;
use crate::types::value::Value;

/// A source-specific monotone position in the change stream.
///
/// `id` is the comparable component (commit LSN for Postgres, sequence number
/// for MySQL binlog positions, cluster-time seconds for Mongo); `text` carries
/// the full source token (GTID set, resume token) when one exists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    #[serde(default)]
    pub text: String,
}

impl Checkpoint {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            text: String::new(),
        }
    }

    pub fn with_text(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.text.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}/{}", self.id, self.text)
        }
    }
}

/// The durable per-mirror cursor triple.
///
/// Invariant: `last_normalize_batch_id <= last_sync_batch_id`, and all three
/// fields only ever advance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchCursor {
    pub last_offset: Checkpoint,
    pub last_sync_batch_id: i64,
    pub last_normalize_batch_id: i64,
}

/// Raw-table record type discriminants, stored in `_PEERDB_RECORD_TYPE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum RecordType {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl RecordType {
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

/// Ordered column name to value mapping for one row image.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordItems {
    columns: BTreeMap<String, Value>,
}

impl RecordItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Renders the items as the JSON object stored in `_PEERDB_DATA`.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .columns
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Renders only the given columns, used for `_PEERDB_MATCH_DATA`.
    pub fn to_json_projected(&self, columns: &[String]) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = columns
            .iter()
            .filter_map(|name| {
                self.columns
                    .get(name)
                    .map(|value| (name.clone(), value.to_json()))
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl FromIterator<(String, Value)> for RecordItems {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

/// Fields shared by every change record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeMeta {
    /// Monotone source offset of the owning commit.
    pub checkpoint: Checkpoint,
    /// Commit time reported by the source.
    pub commit_time: DateTime<Utc>,
    /// Source table or collection identifier.
    pub source_table: String,
    /// Destination table identifier resolved through the table mappings.
    pub destination_table: String,
}

/// A single change pulled from a source stream.
///
/// `Relation` and `Message` never reach the raw table: relations feed the
/// schema tracker's side channel and messages are informational.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeRecord {
    Insert {
        meta: ChangeMeta,
        items: RecordItems,
    },
    Update {
        meta: ChangeMeta,
        items: RecordItems,
        /// Pre-image, present when the source's replica identity provides one.
        old_items: Option<RecordItems>,
        /// Columns the source omitted because their values did not change.
        unchanged_toast_columns: BTreeSet<String>,
    },
    Delete {
        meta: ChangeMeta,
        /// Pre-image or key-only image of the deleted row.
        old_items: RecordItems,
    },
    Relation {
        meta: ChangeMeta,
        schema: TableSchema,
    },
    Message {
        meta: ChangeMeta,
        prefix: String,
        content: Vec<u8>,
    },
}

impl ChangeRecord {
    pub fn meta(&self) -> &ChangeMeta {
        match self {
            ChangeRecord::Insert { meta, .. }
            | ChangeRecord::Update { meta, .. }
            | ChangeRecord::Delete { meta, .. }
            | ChangeRecord::Relation { meta, .. }
            | ChangeRecord::Message { meta, .. } => meta,
        }
    }

    pub fn checkpoint_id(&self) -> u64 {
        self.meta().checkpoint.id
    }

    pub fn record_type(&self) -> Option<RecordType> {
        match self {
            ChangeRecord::Insert { .. } => Some(RecordType::Insert),
            ChangeRecord::Update { .. } => Some(RecordType::Update),
            ChangeRecord::Delete { .. } => Some(RecordType::Delete),
            ChangeRecord::Relation { .. } | ChangeRecord::Message { .. } => None,
        }
    }

    /// The row image that represents the record's effect, if it carries one.
    pub fn items(&self) -> Option<&RecordItems> {
        match self {
            ChangeRecord::Insert { items, .. } | ChangeRecord::Update { items, .. } => Some(items),
            ChangeRecord::Delete { old_items, .. } => Some(old_items),
            ChangeRecord::Relation { .. } | ChangeRecord::Message { .. } => None,
        }
    }

    /// Renders the record into a raw-table row.
    ///
    /// Returns [`None`] for records that do not land in the raw table. The
    /// caller supplies the `uid` (which must sort in arrival order within the
    /// batch) and the batch id assigned by the sync step.
    pub fn to_raw_row(&self, schema: &TableSchema, batch_id: i64, uid: String) -> Option<RawRow> {
        let record_type = self.record_type()?;
        let meta = self.meta();

        let (data, match_data, unchanged_toast) = match self {
            ChangeRecord::Insert { items, .. } => {
                (items.to_json().to_string(), String::new(), String::new())
            }
            ChangeRecord::Update {
                items,
                old_items,
                unchanged_toast_columns,
                ..
            } => {
                let match_source = old_items.as_ref().unwrap_or(items);
                let match_data = match_source
                    .to_json_projected(&schema.primary_key_columns)
                    .to_string();
                (
                    items.to_json().to_string(),
                    match_data,
                    join_sorted(unchanged_toast_columns),
                )
            }
            ChangeRecord::Delete { old_items, .. } => {
                let match_data = old_items
                    .to_json_projected(&schema.primary_key_columns)
                    .to_string();
                (old_items.to_json().to_string(), match_data, String::new())
            }
            ChangeRecord::Relation { .. } | ChangeRecord::Message { .. } => return None,
        };

        Some(RawRow {
            uid,
            timestamp: meta.commit_time.timestamp_micros(),
            destination_table_name: meta.destination_table.clone(),
            data,
            record_type: record_type.as_i16(),
            match_data,
            batch_id,
            unchanged_toast_columns: unchanged_toast,
        })
    }
}

// The CSV is sorted so that equal sets always render identically, which the
// merge generator relies on for grouping.
fn join_sorted(columns: &BTreeSet<String>) -> String {
    let mut out = String::new();
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(column);
    }
    out
}

/// One row of the destination-side raw table.
///
/// Field order matches the raw-table column order exactly:
/// `(_PEERDB_UID, _PEERDB_TIMESTAMP, _PEERDB_DESTINATION_TABLE_NAME,
/// _PEERDB_DATA, _PEERDB_RECORD_TYPE, _PEERDB_MATCH_DATA, _PEERDB_BATCH_ID,
/// _PEERDB_UNCHANGED_TOAST_COLUMNS)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub uid: String,
    pub timestamp: i64,
    pub destination_table_name: String,
    pub data: String,
    pub record_type: i16,
    pub match_data: String,
    pub batch_id: i64,
    pub unchanged_toast_columns: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::schema::{ColumnSchema, TableSchema};
    use crate::types::value::ValueKind;

    fn orders_schema() -> TableSchema {
        TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", ValueKind::Int64, -1, false),
                ColumnSchema::new("total", ValueKind::Numeric, -1, true),
                ColumnSchema::new("note", ValueKind::String, -1, true),
            ],
            vec!["id".to_string()],
        )
    }

    fn meta() -> ChangeMeta {
        ChangeMeta {
            checkpoint: Checkpoint::new(100),
            commit_time: DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap(),
            source_table: "public.orders".to_string(),
            destination_table: "orders".to_string(),
        }
    }

    #[test]
    fn update_raw_row_carries_match_data_and_toast_csv() {
        let mut items = RecordItems::new();
        items.insert("id", Value::Int64(7));
        items.insert("total", Value::Numeric(5.into()));

        let record = ChangeRecord::Update {
            meta: meta(),
            items,
            old_items: None,
            unchanged_toast_columns: BTreeSet::from(["note".to_string(), "blob".to_string()]),
        };

        let raw = record
            .to_raw_row(&orders_schema(), 3, "0003-000001".to_string())
            .unwrap();
        assert_eq!(raw.record_type, 1);
        assert_eq!(raw.batch_id, 3);
        // Sorted CSV regardless of insertion order.
        assert_eq!(raw.unchanged_toast_columns, "blob,note");

        let match_data: serde_json::Value = serde_json::from_str(&raw.match_data).unwrap();
        assert_eq!(match_data, serde_json::json!({"id": 7}));
    }

    #[test]
    fn relation_records_never_render_raw_rows() {
        let record = ChangeRecord::Relation {
            meta: meta(),
            schema: orders_schema(),
        };
        assert!(record
            .to_raw_row(&orders_schema(), 1, "x".to_string())
            .is_none());
        assert_eq!(record.record_type(), None);
    }

    #[test]
    fn delete_match_data_projects_primary_key() {
        let mut old_items = RecordItems::new();
        old_items.insert("id", Value::Int64(9));
        old_items.insert("total", Value::Numeric(1.into()));

        let record = ChangeRecord::Delete {
            meta: meta(),
            old_items,
        };
        let raw = record
            .to_raw_row(&orders_schema(), 8, "u".to_string())
            .unwrap();
        assert_eq!(raw.record_type, 2);

        let match_data: serde_json::Value = serde_json::from_str(&raw.match_data).unwrap();
        assert_eq!(match_data, serde_json::json!({"id": 9}));
    }
}
