use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SluiceResult};
use crate::types::value::ValueKind;
use crate::bail;

/// A type alias for source-specific type modifiers.
///
/// For Postgres this carries `atttypmod` (length for varchar, precision and
/// scale for numeric); other sources set `-1`.
pub type TypeModifier = i32;

/// Schema of a single replicated column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub kind: ValueKind,
    pub modifier: TypeModifier,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(
        name: impl Into<String>,
        kind: ValueKind,
        modifier: TypeModifier,
        nullable: bool,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            modifier,
            nullable,
        }
    }
}

/// Schema of one replicated table as the engine sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Destination-facing identifier of the table.
    pub name: String,
    /// Ordered columns.
    pub columns: Vec<ColumnSchema>,
    /// Names of the primary-key columns, a subset of `columns`.
    pub primary_key_columns: Vec<String>,
    /// When set the source publishes full pre-images, and every non-TOAST
    /// column contributes to row identity.
    #[serde(default)]
    pub replica_identity_full: bool,
    /// When set the destination enforces NOT NULL on non-nullable columns.
    #[serde(default)]
    pub nullable_enabled: bool,
}

impl TableSchema {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnSchema>,
        primary_key_columns: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key_columns,
            replica_identity_full: false,
            nullable_enabled: false,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Columns used for row identity during merges: the primary key, or all
    /// columns when the table has replica identity full and no key.
    pub fn identity_columns(&self) -> Vec<String> {
        if !self.primary_key_columns.is_empty() {
            return self.primary_key_columns.clone();
        }
        if self.replica_identity_full {
            return self.columns.iter().map(|c| c.name.clone()).collect();
        }
        Vec::new()
    }

    /// Checks the structural invariant that every primary-key column exists.
    pub fn validate(&self) -> SluiceResult<()> {
        for pk in &self.primary_key_columns {
            if self.column(pk).is_none() {
                bail!(
                    ErrorKind::ValidationError,
                    "Primary key column missing from schema",
                    format!("column '{pk}' is not part of table '{}'", self.name)
                );
            }
        }

        Ok(())
    }

    /// Returns the columns present in `newer` but absent here.
    ///
    /// Dropped or retyped columns are deliberately not computed: those are
    /// surfaced to the operator instead of being replayed (see
    /// [`crate::schema_tracker`]).
    pub fn added_columns_in(&self, newer: &TableSchema) -> Vec<AddedColumn> {
        newer
            .columns
            .iter()
            .filter(|c| self.column(&c.name).is_none())
            .map(|c| AddedColumn {
                name: c.name.clone(),
                kind: c.kind,
                nullable: c.nullable,
            })
            .collect()
    }
}

/// A column added to a source table mid-stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedColumn {
    pub name: String,
    pub kind: ValueKind,
    pub nullable: bool,
}

/// A schema change detected in the source stream that must be replayed on the
/// destination before the affected batch normalizes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDelta {
    pub source_table: String,
    pub destination_table: String,
    pub added_columns: Vec<AddedColumn>,
    /// Whether NOT NULL constraints should be propagated for the additions.
    #[serde(default)]
    pub nullable_enabled: bool,
}

impl SchemaDelta {
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_schema() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnSchema::new("id", ValueKind::Int32, -1, false),
                ColumnSchema::new("email", ValueKind::String, -1, false),
            ],
            vec!["id".to_string()],
        )
    }

    #[test]
    fn validate_rejects_unknown_pk_column() {
        let mut schema = base_schema();
        schema.primary_key_columns = vec!["missing".to_string()];
        assert!(schema.validate().is_err());
    }

    #[test]
    fn added_columns_only_reports_new_names() {
        let old = base_schema();
        let mut new = base_schema();
        new.columns
            .push(ColumnSchema::new("c", ValueKind::Int32, -1, true));
        // Retypes are not reported as additions.
        new.columns[1].kind = ValueKind::Json;

        let added = old.added_columns_in(&new);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].name, "c");
    }

    #[test]
    fn identity_falls_back_to_all_columns_for_full_replica_identity() {
        let mut schema = base_schema();
        schema.primary_key_columns.clear();
        schema.replica_identity_full = true;
        assert_eq!(schema.identity_columns(), vec!["id", "email"]);
    }
}
