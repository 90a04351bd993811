//! Schema descriptor types for tables, columns, indexes, and foreign keys.
//!
//! Descriptors are immutable snapshots of one table's shape at read time.
//! They are never mutated in place; a fresh inspection produces a new
//! descriptor that replaces the old one.

use serde::{Deserialize, Serialize};

/// Snapshot of one table's structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name.
    pub name: String,

    /// Column definitions, ordered by ordinal position.
    pub columns: Vec<ColumnDescriptor>,

    /// Primary key column names, in key order.
    pub primary_key: Vec<String>,

    /// Non-primary-key indexes.
    pub indexes: Vec<IndexDescriptor>,

    /// Foreign key constraints declared on this table.
    pub foreign_keys: Vec<ForeignKeyDescriptor>,

    /// Approximate row count at inspection time.
    pub row_count: i64,
}

impl TableDescriptor {
    /// Find the auto-increment column, if the table has one.
    ///
    /// MySQL allows at most one per table.
    pub fn auto_increment_column(&self) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.is_auto_increment)
    }

    /// Whether the table has a single-column integer primary key usable for
    /// keyset-paginated reads.
    pub fn supports_keyset_pagination(&self) -> bool {
        if self.primary_key.len() != 1 {
            return false;
        }
        self.columns
            .iter()
            .find(|c| c.name == self.primary_key[0])
            .map(|c| c.is_integer())
            .unwrap_or(false)
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Declared type strings in ordinal order (for value decoding).
    pub fn column_types(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.column_type.clone()).collect()
    }

    /// Compare two descriptors column by column, ignoring foreign keys and
    /// index sets. Types are canonicalized before comparison so that
    /// `VARCHAR(255)` and `varchar(255)` compare equal.
    ///
    /// Returns human-readable difference descriptions; empty means the
    /// column structures match.
    pub fn column_differences(&self, other: &TableDescriptor) -> Vec<String> {
        let mut diffs = Vec::new();

        for col in &self.columns {
            match other.columns.iter().find(|c| c.name == col.name) {
                None => diffs.push(format!("column '{}' missing on target", col.name)),
                Some(other_col) => {
                    if col.canonical_type() != other_col.canonical_type() {
                        diffs.push(format!(
                            "column '{}' type differs: {} vs {}",
                            col.name,
                            col.canonical_type(),
                            other_col.canonical_type()
                        ));
                    } else if col.is_nullable != other_col.is_nullable
                        || col.default != other_col.default
                    {
                        diffs.push(format!("column '{}' definition differs", col.name));
                    }
                }
            }
        }

        for col in &other.columns {
            if !self.columns.iter().any(|c| c.name == col.name) {
                diffs.push(format!("column '{}' only exists on target", col.name));
            }
        }

        diffs
    }
}

/// One column's declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,

    /// Full declared type string as reported by the engine
    /// (e.g. `int unsigned`, `varchar(255)`, `decimal(10,2)`).
    pub column_type: String,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Declared default value, verbatim from the catalog. `None` means no
    /// default was declared.
    pub default: Option<String>,

    /// Whether the column carries the AUTO_INCREMENT attribute.
    pub is_auto_increment: bool,

    /// Ordinal position (1-based).
    pub ordinal_pos: u32,
}

impl ColumnDescriptor {
    /// Canonicalized type for comparison: lowercase, collapsed whitespace.
    /// Applied identically on both sides so declared-case differences do not
    /// register as structural drift.
    pub fn canonical_type(&self) -> String {
        self.column_type
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Whether the declared type is an integer family type.
    pub fn is_integer(&self) -> bool {
        let t = self.canonical_type();
        let base = t.split(['(', ' ']).next().unwrap_or("");
        matches!(
            base,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
        )
    }
}

/// Index metadata (non-primary-key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name.
    pub name: String,

    /// Indexed column names, in index order.
    pub columns: Vec<String>,

    /// Whether the index is unique.
    pub is_unique: bool,
}

/// Foreign key metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    /// Constraint name.
    pub name: String,

    /// Local column names.
    pub columns: Vec<String>,

    /// Referenced table name.
    pub ref_table: String,

    /// Referenced column names.
    pub ref_columns: Vec<String>,

    /// ON DELETE action (e.g. `RESTRICT`, `CASCADE`).
    pub on_delete: String,

    /// ON UPDATE action.
    pub on_update: String,
}

impl ForeignKeyDescriptor {
    /// Whether the constraint references its own table. Self-references do
    /// not participate in dependency ordering.
    pub fn is_self_reference(&self, table: &str) -> bool {
        self.ref_table == table
    }
}
