//! Core types shared across the replication engine.

pub mod schema;
pub mod value;

pub use schema::{ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, TableDescriptor};
pub use value::{Batch, SqlNullType, SqlValue};

/// Quote a MySQL identifier, doubling embedded backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
