//! Warehouse schema types and diffing
//!
//! A warehouse schema maps table names to column definitions. Producers
//! declare one per staging file; the dispatcher merges those declarations
//! into the upload's schema, and the schema-migration phase diffs that
//! merged schema against the journaled snapshot of what the destination
//! already has.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Column definitions for one table.
pub type TableSchema = BTreeMap<String, ColumnType>;

/// Column types the engine understands.
///
/// Adapters map these onto destination-native types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        }
    }
}

/// Full table -> column -> type mapping for one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarehouseSchema(pub BTreeMap<String, TableSchema>);

impl WarehouseSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.0.get(name)
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Fold `other` into `self`. The first declared type for a column wins;
    /// later conflicting declarations are ignored.
    pub fn merge_from(&mut self, other: &WarehouseSchema) {
        for (table, columns) in &other.0 {
            let entry = self.0.entry(table.clone()).or_default();
            for (column, column_type) in columns {
                entry.entry(column.clone()).or_insert(*column_type);
            }
        }
    }

    /// Union of many schemas, first type wins per column.
    pub fn merged<'a>(schemas: impl IntoIterator<Item = &'a WarehouseSchema>) -> WarehouseSchema {
        let mut merged = WarehouseSchema::new();
        for schema in schemas {
            merged.merge_from(schema);
        }
        merged
    }
}

/// What schema migration has to apply: tables the destination lacks
/// entirely, and columns missing from tables it already has.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    pub new_tables: BTreeMap<String, TableSchema>,
    pub new_columns: BTreeMap<String, TableSchema>,
}

impl SchemaDiff {
    /// Diff `proposed` against `current`. Type changes for existing columns
    /// are ignored; the engine never rewrites a column in place.
    pub fn between(current: &WarehouseSchema, proposed: &WarehouseSchema) -> Self {
        let mut diff = SchemaDiff::default();
        for (table, columns) in &proposed.0 {
            match current.table(table) {
                None => {
                    diff.new_tables.insert(table.clone(), columns.clone());
                }
                Some(existing) => {
                    let missing: TableSchema = columns
                        .iter()
                        .filter(|(column, _)| !existing.contains_key(*column))
                        .map(|(column, column_type)| (column.clone(), *column_type))
                        .collect();
                    if !missing.is_empty() {
                        diff.new_columns.insert(table.clone(), missing);
                    }
                }
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.new_tables.is_empty() && self.new_columns.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn schema(tables: &[(&str, &[(&str, ColumnType)])]) -> WarehouseSchema {
        WarehouseSchema(
            tables
                .iter()
                .map(|(name, columns)| {
                    (
                        name.to_string(),
                        columns
                            .iter()
                            .map(|(c, t)| (c.to_string(), *t))
                            .collect::<TableSchema>(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_diff_detects_new_table() {
        let current = schema(&[("pageviews", &[("id", ColumnType::String)])]);
        let proposed = schema(&[
            ("pageviews", &[("id", ColumnType::String)]),
            ("clicks", &[("id", ColumnType::String)]),
        ]);

        let diff = SchemaDiff::between(&current, &proposed);
        assert_eq!(diff.new_tables.len(), 1);
        assert!(diff.new_tables.contains_key("clicks"));
        assert!(diff.new_columns.is_empty());
    }

    #[test]
    fn test_diff_detects_new_columns_only() {
        let current = schema(&[("pageviews", &[("id", ColumnType::String)])]);
        let proposed = schema(&[(
            "pageviews",
            &[("id", ColumnType::String), ("at", ColumnType::Timestamp)],
        )]);

        let diff = SchemaDiff::between(&current, &proposed);
        assert!(diff.new_tables.is_empty());
        assert_eq!(diff.new_columns["pageviews"].len(), 1);
        assert!(diff.new_columns["pageviews"].contains_key("at"));
    }

    #[test]
    fn test_diff_ignores_type_conflicts() {
        let current = schema(&[("events", &[("value", ColumnType::Int)])]);
        let proposed = schema(&[("events", &[("value", ColumnType::String)])]);

        let diff = SchemaDiff::between(&current, &proposed);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_merge_first_type_wins() {
        let a = schema(&[("events", &[("value", ColumnType::Int)])]);
        let b = schema(&[("events", &[("value", ColumnType::String), ("id", ColumnType::String)])]);

        let merged = WarehouseSchema::merged([&a, &b]);
        assert_eq!(merged.table("events").unwrap()["value"], ColumnType::Int);
        assert_eq!(merged.table("events").unwrap()["id"], ColumnType::String);
    }

    #[test]
    fn test_serde_round_trip() {
        let s = schema(&[("identifies", &[("user_id", ColumnType::String)])]);
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, r#"{"identifies":{"user_id":"string"}}"#);
        let back: WarehouseSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
