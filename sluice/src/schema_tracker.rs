//! Tracks source table schemas across a mirror's lifetime and turns relation
//! messages into schema deltas.
//!
//! Only column additions are replayed on the destination. Drops and type
//! changes are refused here with a [`ErrorKind::SchemaDrift`] error, which
//! the classifier routes to the operator; guessing at destructive DDL is
//! worse than pausing.

use std::collections::HashMap;

use metrics::counter;
use tracing::info;

use crate::bail;
use crate::error::{ErrorKind, SluiceResult};
use crate::metrics::{MIRROR_LABEL, SLUICE_SCHEMA_DELTAS_TOTAL};
use crate::types::{SchemaDelta, TableSchema};

/// In-memory view of every replicated table's current schema.
pub struct SchemaTracker {
    mirror_name: String,
    schemas: HashMap<String, TableSchema>,
}

impl SchemaTracker {
    /// Creates a tracker seeded with the schemas discovered at setup.
    ///
    /// Keys are source table identifiers.
    pub fn new(mirror_name: impl Into<String>, schemas: HashMap<String, TableSchema>) -> Self {
        Self {
            mirror_name: mirror_name.into(),
            schemas,
        }
    }

    pub fn schema(&self, source_table: &str) -> Option<&TableSchema> {
        self.schemas.get(source_table)
    }

    /// Compares a relation message against the cached schema.
    ///
    /// Returns a delta when columns were added, [`None`] when nothing
    /// relevant changed, and an error when a column was dropped or retyped.
    /// On success the cache is updated so later records resolve against the
    /// new shape.
    pub fn observe_relation(
        &mut self,
        source_table: &str,
        destination_table: &str,
        observed: &TableSchema,
    ) -> SluiceResult<Option<SchemaDelta>> {
        let Some(current) = self.schemas.get(source_table) else {
            // First sighting of a table added to the publication mid-stream.
            self.schemas
                .insert(source_table.to_string(), observed.clone());
            return Ok(None);
        };

        for column in &current.columns {
            match observed.column(&column.name) {
                None => {
                    bail!(
                        ErrorKind::SchemaDrift,
                        "Source dropped a replicated column",
                        format!(
                            "column '{}' of '{source_table}' disappeared; \
                             drop it on the destination manually and resync",
                            column.name
                        )
                    );
                }
                Some(observed_column) if observed_column.kind != column.kind => {
                    bail!(
                        ErrorKind::SchemaDrift,
                        "Source changed a replicated column type",
                        format!(
                            "column '{}' of '{source_table}' changed from {} to {}",
                            column.name, column.kind, observed_column.kind
                        )
                    );
                }
                Some(_) => {}
            }
        }

        let added_columns = current.added_columns_in(observed);
        if added_columns.is_empty() {
            return Ok(None);
        }

        info!(
            mirror = %self.mirror_name,
            source_table,
            added = added_columns.len(),
            "schema delta detected"
        );
        counter!(
            SLUICE_SCHEMA_DELTAS_TOTAL,
            MIRROR_LABEL => self.mirror_name.clone()
        )
        .increment(added_columns.len() as u64);

        let delta = SchemaDelta {
            source_table: source_table.to_string(),
            destination_table: destination_table.to_string(),
            added_columns,
            nullable_enabled: current.nullable_enabled,
        };

        self.schemas
            .insert(source_table.to_string(), observed.clone());

        Ok(Some(delta))
    }

    /// Snapshot of all tracked schemas, used for catalog persistence.
    pub fn snapshot(&self) -> &HashMap<String, TableSchema> {
        &self.schemas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnSchema, ValueKind};

    fn schema(columns: &[(&str, ValueKind)]) -> TableSchema {
        TableSchema::new(
            "orders",
            columns
                .iter()
                .map(|(name, kind)| ColumnSchema::new(*name, *kind, -1, true))
                .collect(),
            vec!["id".to_string()],
        )
    }

    fn tracker() -> SchemaTracker {
        let mut schemas = HashMap::new();
        schemas.insert(
            "public.orders".to_string(),
            schema(&[("id", ValueKind::Int64), ("total", ValueKind::Numeric)]),
        );
        SchemaTracker::new("m1", schemas)
    }

    #[test]
    fn added_column_produces_delta_and_updates_cache() {
        let mut tracker = tracker();
        let observed = schema(&[
            ("id", ValueKind::Int64),
            ("total", ValueKind::Numeric),
            ("c", ValueKind::Int32),
        ]);

        let delta = tracker
            .observe_relation("public.orders", "orders", &observed)
            .unwrap()
            .expect("expected a delta");
        assert_eq!(delta.added_columns.len(), 1);
        assert_eq!(delta.added_columns[0].name, "c");
        assert_eq!(delta.destination_table, "orders");

        // Re-observing the same shape is quiet.
        assert!(tracker
            .observe_relation("public.orders", "orders", &observed)
            .unwrap()
            .is_none());
    }

    #[test]
    fn dropped_column_is_refused() {
        let mut tracker = tracker();
        let observed = schema(&[("id", ValueKind::Int64)]);
        let err = tracker
            .observe_relation("public.orders", "orders", &observed)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaDrift);
    }

    #[test]
    fn retyped_column_is_refused() {
        let mut tracker = tracker();
        let observed = schema(&[("id", ValueKind::Int64), ("total", ValueKind::String)]);
        let err = tracker
            .observe_relation("public.orders", "orders", &observed)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaDrift);
    }

    #[test]
    fn unknown_table_is_adopted_silently() {
        let mut tracker = tracker();
        let observed = schema(&[("id", ValueKind::Int64)]);
        assert!(tracker
            .observe_relation("public.new_table", "new_table", &observed)
            .unwrap()
            .is_none());
        assert!(tracker.schema("public.new_table").is_some());
    }
}
