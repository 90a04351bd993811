//! Data pass: stream one table's rows from source to target in batches.

use tokio::sync::watch;
use tracing::{debug, info};

use crate::core::schema::TableDescriptor;
use crate::error::{ReplicateError, Result};
use crate::events::{RunWarning, WarningKind};
use crate::source::{MysqlReader, ReadOptions};
use crate::target::MysqlWriter;

/// Outcome of one table's data copy.
#[derive(Debug, Clone)]
pub struct TableDataOutcome {
    /// Rows written to the target.
    pub rows: u64,

    /// Whether the target column still carries AUTO_INCREMENT after the
    /// copy. `false` means the attribute was removed to preserve literal
    /// zero key values and was not restored.
    pub identity_preserved: bool,

    /// Warnings raised during the copy.
    pub warnings: Vec<RunWarning>,
}

/// Copy all rows of one table from source to target.
///
/// Existing target rows are deleted first. If the table has an
/// auto-increment column and any source row holds the literal value 0 in
/// it, the attribute is removed from the target column before the first
/// insert so MySQL does not renumber those rows; the attribute stays off
/// for the rest of the run.
///
/// Rows stream through a bounded channel; the reader runs ahead of the
/// writer by at most `read_ahead` batches.
pub async fn copy_table_data(
    reader: &MysqlReader,
    writer: &MysqlWriter,
    descriptor: &TableDescriptor,
    batch_size: usize,
    read_ahead: usize,
    cancel: &watch::Receiver<bool>,
) -> Result<TableDataOutcome> {
    let table = &descriptor.name;
    let mut warnings = Vec::new();

    if *cancel.borrow() {
        return Err(ReplicateError::Cancelled);
    }

    let deleted = writer.delete_all_rows(table).await?;
    debug!(%table, deleted, "cleared target rows");

    // Zero-identity probe runs once, before the first insert.
    let mut identity_preserved = true;
    if let Some(auto_col) = descriptor.auto_increment_column() {
        let zero_rows = reader.count_zero_identity_rows(table, &auto_col.name).await?;
        if zero_rows > 0 {
            writer.drop_auto_increment(table, auto_col).await?;
            identity_preserved = false;
            warnings.push(RunWarning::for_table(
                WarningKind::DataIntegrity,
                table.clone(),
                format!(
                    "column '{}' holds {} zero-valued key row(s); AUTO_INCREMENT removed on target to preserve them",
                    auto_col.name, zero_rows
                ),
            ));
        }
    }

    let opts = ReadOptions::for_table(descriptor, batch_size);
    let columns = opts.columns.clone();
    let mut rx = reader.read_table(opts, read_ahead);

    let mut total_rows: u64 = 0;
    while let Some(batch) = rx.recv().await {
        if *cancel.borrow() {
            return Err(ReplicateError::Cancelled);
        }
        let batch = batch?;
        let is_last = batch.is_last;
        total_rows += writer.write_batch(table, &columns, batch).await?;
        if is_last {
            break;
        }
    }

    info!(%table, rows = total_rows, identity_preserved, "table data copied");

    Ok(TableDataOutcome {
        rows: total_rows,
        identity_preserved,
        warnings,
    })
}
