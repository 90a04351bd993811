//! Structure pass: drop and recreate one table from its source descriptor.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::core::schema::TableDescriptor;
use crate::error::{ReplicateError, Result};
use crate::events::{RunWarning, WarningKind};
use crate::target::MysqlWriter;

/// Recreate one table on the target from its source descriptor.
///
/// If the table already exists, foreign keys on other target tables that
/// reference it are dropped first (they block DROP TABLE), then the table is
/// dropped and recreated. Constraints named in `skip_constraints` are
/// omitted from the new declaration.
///
/// A CREATE failure caused by the foreign-key clauses is retried once with
/// all of them omitted; each remaining constraint is then attached
/// individually, and the ones that still fail are reported as warnings
/// rather than failing the table.
pub async fn rebuild_table(
    writer: &MysqlWriter,
    descriptor: &TableDescriptor,
    skip_constraints: &BTreeSet<String>,
) -> Result<Vec<RunWarning>> {
    let mut warnings = Vec::new();
    let table = &descriptor.name;

    if writer.table_exists(table).await? {
        for referencing in writer.list_referencing_constraints(table).await? {
            debug!(
                table,
                referencing_table = %referencing.table,
                constraint = %referencing.constraint,
                "detaching referencing foreign key before drop"
            );
            writer
                .drop_foreign_key(&referencing.table, &referencing.constraint)
                .await?;
        }
        writer.drop_table(table).await?;
    }

    match writer.create_table(descriptor, skip_constraints).await {
        Ok(()) => Ok(warnings),
        Err(first_err @ ReplicateError::Structural { .. }) => {
            if descriptor.foreign_keys.len() <= skip_constraints.len() {
                // No constraint left to drop; the failure is elsewhere.
                return Err(first_err);
            }

            warn!(
                table,
                error = %first_err,
                "CREATE TABLE failed; retrying without foreign key constraints"
            );

            let all_constraints: BTreeSet<String> = descriptor
                .foreign_keys
                .iter()
                .map(|fk| fk.name.clone())
                .collect();
            writer.create_table(descriptor, &all_constraints).await?;

            // Attach the constraints one by one so a single bad one does
            // not take the rest down with it. One retry each.
            for fk in &descriptor.foreign_keys {
                if skip_constraints.contains(&fk.name) {
                    continue;
                }
                let mut attempt = writer.add_foreign_key(table, fk).await;
                if attempt.is_err() {
                    attempt = writer.add_foreign_key(table, fk).await;
                }
                if let Err(err) = attempt {
                    warnings.push(RunWarning::for_constraint(
                        WarningKind::StructuralConflict,
                        table.clone(),
                        fk.name.clone(),
                        format!("constraint {} not attached: {}", fk.name, err),
                    ));
                }
            }

            Ok(warnings)
        }
        Err(other) => Err(other),
    }
}
