//! Plan execution: structure pass, parallel data pass, deferred constraint
//! attachment.

mod data;
mod structure;

pub use data::{copy_table_data, TableDataOutcome};
pub use structure::rebuild_table;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use crate::config::ReplicationConfig;
use crate::error::{ReplicateError, Result};
use crate::events::{EventSink, ReplicationEvent, RunWarning, WarningKind};
use crate::plan::{ReplicationPlan, ReplicationSet};
use crate::source::MysqlReader;
use crate::target::MysqlWriter;

/// Aggregate outcome of executing a plan.
#[derive(Debug, Default)]
pub struct PlanOutcome {
    /// Tables whose structure was recreated.
    pub tables_recreated: usize,

    /// Tables whose data was copied.
    pub tables_copied: usize,

    /// Total rows written across all tables.
    pub rows_copied: u64,

    /// All warnings raised during execution.
    pub warnings: Vec<RunWarning>,
}

/// Execute a replication plan end to end.
///
/// Structure is rebuilt sequentially in creation order. Data is then copied
/// in dependency waves: tables whose referenced tables are all in earlier
/// waves run concurrently, bounded by the worker limit. Cycle-broken
/// constraints are attached last, once both sides exist and hold data.
///
/// Per-table structural and transfer failures degrade to warnings; any
/// other error aborts execution.
pub async fn execute_plan(
    reader: Arc<MysqlReader>,
    writer: Arc<MysqlWriter>,
    set: &ReplicationSet,
    plan: &ReplicationPlan,
    replication: &ReplicationConfig,
    sink: Arc<dyn EventSink>,
    cancel: watch::Receiver<bool>,
) -> Result<PlanOutcome> {
    let mut outcome = PlanOutcome::default();

    // Structure pass, in creation order.
    for action in &plan.actions {
        if *cancel.borrow() {
            return Err(ReplicateError::Cancelled);
        }
        let descriptor = set
            .tables
            .get(&action.table)
            .ok_or_else(|| ReplicateError::table_not_found(&action.table))?;

        sink.emit(&ReplicationEvent::TableStarted {
            table: action.table.clone(),
            with_data: action.sync_data,
        });

        match rebuild_table(&writer, descriptor, &action.skip_constraints).await {
            Ok(warnings) => {
                outcome.tables_recreated += 1;
                emit_warnings(&sink, &mut outcome.warnings, warnings);
            }
            Err(err) if !err.is_fatal() => {
                emit_warnings(
                    &sink,
                    &mut outcome.warnings,
                    vec![RunWarning::for_table(
                        WarningKind::StructuralConflict,
                        action.table.clone(),
                        err.to_string(),
                    )],
                );
            }
            Err(err) => return Err(err),
        }
    }

    // Data pass, in dependency waves.
    let waves = copy_waves(set, plan);
    let semaphore = Arc::new(Semaphore::new(replication.workers.max(1)));

    for wave in waves {
        if *cancel.borrow() {
            return Err(ReplicateError::Cancelled);
        }

        let mut handles = Vec::with_capacity(wave.len());
        for table in wave {
            let descriptor = set
                .tables
                .get(&table)
                .ok_or_else(|| ReplicateError::table_not_found(&table))?
                .clone();
            let reader = Arc::clone(&reader);
            let writer = Arc::clone(&writer);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let batch_size = replication.batch_size;
            let read_ahead = replication.read_ahead_batches;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ReplicateError::Cancelled)?;
                copy_table_data(&reader, &writer, &descriptor, batch_size, read_ahead, &cancel)
                    .await
                    .map(|o| (descriptor.name.clone(), o))
            }));
        }

        for handle in handles {
            let result = handle
                .await
                .map_err(|e| ReplicateError::transfer("worker", e.to_string()))?;
            match result {
                Ok((table, data_outcome)) => {
                    outcome.tables_copied += 1;
                    outcome.rows_copied += data_outcome.rows;
                    emit_warnings(&sink, &mut outcome.warnings, data_outcome.warnings);
                    sink.emit(&ReplicationEvent::TableCompleted {
                        table,
                        rows: data_outcome.rows,
                        identity_preserved: data_outcome.identity_preserved,
                    });
                }
                Err(err) if !err.is_fatal() => {
                    emit_warnings(
                        &sink,
                        &mut outcome.warnings,
                        vec![RunWarning::new(WarningKind::DataIntegrity, err.to_string())],
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    // Deferred constraints: both endpoints now exist and hold data.
    let deferred = attach_deferred_constraints(&writer, set, plan).await?;
    emit_warnings(&sink, &mut outcome.warnings, deferred);

    info!(
        tables_recreated = outcome.tables_recreated,
        tables_copied = outcome.tables_copied,
        rows = outcome.rows_copied,
        warnings = outcome.warnings.len(),
        "plan executed"
    );

    Ok(outcome)
}

/// Attach every cycle-broken constraint. Failures degrade to warnings: the
/// data may legitimately not satisfy a constraint that was absent while it
/// loaded.
async fn attach_deferred_constraints(
    writer: &MysqlWriter,
    set: &ReplicationSet,
    plan: &ReplicationPlan,
) -> Result<Vec<RunWarning>> {
    let mut warnings = Vec::new();

    for broken in &plan.broken {
        let Some(descriptor) = set.tables.get(&broken.table) else {
            continue;
        };
        let Some(fk) = descriptor
            .foreign_keys
            .iter()
            .find(|fk| fk.name == broken.constraint)
        else {
            continue;
        };

        // One retry covers transient lock contention on a busy target.
        let mut attempt = writer.add_foreign_key(&broken.table, fk).await;
        if attempt.is_err() {
            attempt = writer.add_foreign_key(&broken.table, fk).await;
        }

        match attempt {
            Ok(()) => {}
            Err(err) if !err.is_fatal() => {
                warn!(
                    table = %broken.table,
                    constraint = %broken.constraint,
                    error = %err,
                    "deferred constraint could not be attached"
                );
                warnings.push(RunWarning::for_constraint(
                    WarningKind::StructuralConflict,
                    broken.table.clone(),
                    broken.constraint.clone(),
                    format!("deferred constraint not attached: {}", err),
                ));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(warnings)
}

/// Group full-sync tables into dependency waves.
///
/// A table lands one wave after the deepest full-sync table it references
/// (edges to earlier creation-order positions only, so broken cycle edges
/// do not recurse). Tables in the same wave have no ordering constraint
/// between them and may copy concurrently.
fn copy_waves(set: &ReplicationSet, plan: &ReplicationPlan) -> Vec<Vec<String>> {
    let order_pos: BTreeMap<&str, usize> = plan
        .actions
        .iter()
        .enumerate()
        .map(|(i, a)| (a.table.as_str(), i))
        .collect();

    let full_sync: BTreeSet<&str> = plan
        .actions
        .iter()
        .filter(|a| a.sync_data)
        .map(|a| a.table.as_str())
        .collect();

    let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
    let mut waves: Vec<Vec<String>> = Vec::new();

    for action in plan.actions.iter().filter(|a| a.sync_data) {
        let table = action.table.as_str();
        let my_pos = order_pos[table];

        let mut level = 0;
        if let Some(descriptor) = set.tables.get(table) {
            for fk in &descriptor.foreign_keys {
                let dep = fk.ref_table.as_str();
                if dep == table || !full_sync.contains(dep) {
                    continue;
                }
                // Only honor edges that point backwards in creation order;
                // a forward edge is a broken cycle edge.
                if order_pos.get(dep).is_some_and(|p| *p < my_pos) {
                    if let Some(d) = depth.get(dep) {
                        level = level.max(d + 1);
                    }
                }
            }
        }

        depth.insert(table, level);
        if waves.len() <= level {
            waves.resize_with(level + 1, Vec::new);
        }
        waves[level].push(table.to_string());
    }

    waves
}

fn emit_warnings(
    sink: &Arc<dyn EventSink>,
    collected: &mut Vec<RunWarning>,
    warnings: Vec<RunWarning>,
) {
    for warning in warnings {
        sink.emit(&ReplicationEvent::WarningRaised(warning.clone()));
        collected.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ColumnDescriptor, ForeignKeyDescriptor, TableDescriptor};
    use crate::plan::{DependencyGraph, ReplicationPlan, ReplicationSet};

    fn table(name: &str, refs: &[(&str, &str)]) -> TableDescriptor {
        TableDescriptor {
            name: name.to_string(),
            columns: vec![ColumnDescriptor {
                name: "id".to_string(),
                column_type: "int".to_string(),
                is_nullable: false,
                default: None,
                is_auto_increment: false,
                ordinal_pos: 1,
            }],
            primary_key: vec!["id".to_string()],
            indexes: vec![],
            foreign_keys: refs
                .iter()
                .map(|(constraint, ref_table)| ForeignKeyDescriptor {
                    name: constraint.to_string(),
                    columns: vec![format!("{}_id", ref_table)],
                    ref_table: ref_table.to_string(),
                    ref_columns: vec!["id".to_string()],
                    on_delete: "RESTRICT".to_string(),
                    on_update: "RESTRICT".to_string(),
                })
                .collect(),
            row_count: 0,
        }
    }

    fn build_plan(tables: Vec<TableDescriptor>, full_sync: &[&str]) -> (ReplicationSet, ReplicationPlan) {
        let full_sync: Vec<String> = full_sync.iter().map(|s| s.to_string()).collect();
        let set = ReplicationSet::partition(tables, &full_sync);
        let resolution = DependencyGraph::build(set.tables.values()).resolve();
        let plan = ReplicationPlan::build(&set, &resolution);
        (set, plan)
    }

    #[test]
    fn test_copy_waves_respect_dependencies() {
        let (set, plan) = build_plan(
            vec![
                table("orders", &[("fk_o_c", "customers")]),
                table("customers", &[]),
                table("products", &[]),
            ],
            &["orders", "customers", "products"],
        );

        let waves = copy_waves(&set, &plan);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0], vec!["customers", "products"]);
        assert_eq!(waves[1], vec!["orders"]);
    }

    #[test]
    fn test_copy_waves_skip_structure_only_dependencies() {
        // "orders" references "customers", but customers is structure-only:
        // no data ordering constraint exists between them.
        let (set, plan) = build_plan(
            vec![table("orders", &[("fk_o_c", "customers")]), table("customers", &[])],
            &["orders"],
        );

        let waves = copy_waves(&set, &plan);
        assert_eq!(waves, vec![vec!["orders".to_string()]]);
    }

    #[test]
    fn test_copy_waves_ignore_broken_cycle_edges() {
        let (set, plan) = build_plan(
            vec![
                table("a", &[("fk_a_b", "b")]),
                table("b", &[("fk_b_a", "a")]),
            ],
            &["a", "b"],
        );

        // Cycle broken at a -> b; creation order is [a, b], so only the
        // b -> a edge orders the copy.
        let waves = copy_waves(&set, &plan);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0], vec!["a"]);
        assert_eq!(waves[1], vec!["b"]);
    }

    #[test]
    fn test_copy_waves_chain_depth() {
        let (set, plan) = build_plan(
            vec![
                table("c", &[("fk_c_b", "b")]),
                table("b", &[("fk_b_a", "a")]),
                table("a", &[]),
            ],
            &["a", "b", "c"],
        );

        let waves = copy_waves(&set, &plan);
        assert_eq!(
            waves,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string()],
                vec!["c".to_string()]
            ]
        );
    }
}
