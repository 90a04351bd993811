//! Replication planning: table set partitioning, foreign-key dependency
//! resolution, and the per-run action plan.
//!
//! The dependency resolver is a Kahn topological sort over the foreign-key
//! graph restricted to the replication set. All internal collections are
//! BTree-keyed so ordering decisions are deterministic: among tables with no
//! remaining dependency, the ascending table name wins.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::TableDescriptor;
use crate::events::{RunWarning, WarningKind};

/// The set of tables discovered on the source, partitioned by sync mode.
#[derive(Debug, Clone)]
pub struct ReplicationSet {
    /// Descriptors of all discovered source tables, keyed by name.
    pub tables: BTreeMap<String, TableDescriptor>,

    /// Names of tables replicated with structure and data.
    pub full_sync: BTreeSet<String>,

    /// Requested full-sync names that do not exist on the source. Reported,
    /// never silently dropped.
    pub unknown_full_sync: Vec<String>,
}

impl ReplicationSet {
    /// Partition the discovered tables against the caller-supplied full-sync
    /// name list.
    pub fn partition(tables: Vec<TableDescriptor>, requested_full_sync: &[String]) -> Self {
        let tables: BTreeMap<String, TableDescriptor> =
            tables.into_iter().map(|t| (t.name.clone(), t)).collect();

        let mut full_sync = BTreeSet::new();
        let mut unknown_full_sync = Vec::new();
        for name in requested_full_sync {
            if tables.contains_key(name) {
                full_sync.insert(name.clone());
            } else {
                unknown_full_sync.push(name.clone());
            }
        }

        Self {
            tables,
            full_sync,
            unknown_full_sync,
        }
    }

    /// Warnings for full-sync names missing from the source.
    pub fn warnings(&self) -> Vec<RunWarning> {
        self.unknown_full_sync
            .iter()
            .map(|name| {
                RunWarning::for_table(
                    WarningKind::UnknownTable,
                    name.clone(),
                    format!("full-sync table '{}' not found on source", name),
                )
            })
            .collect()
    }
}

/// A foreign key marked for temporary removal to break a dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenConstraint {
    /// Table declaring the constraint.
    pub table: String,

    /// Constraint name.
    pub constraint: String,

    /// Table the constraint references.
    pub ref_table: String,
}

/// Result of dependency resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Order in which tables can be created so that every referenced table
    /// already exists (modulo broken constraints).
    pub creation_order: Vec<String>,

    /// Foreign keys excluded from ordering to break multi-table cycles.
    pub broken: Vec<BrokenConstraint>,
}

impl Resolution {
    /// Safe deletion order: the exact reverse of the creation order.
    pub fn deletion_order(&self) -> Vec<String> {
        self.creation_order.iter().rev().cloned().collect()
    }

    /// Constraint names that must be skipped at creation time for a table.
    pub fn skipped_constraints(&self, table: &str) -> BTreeSet<String> {
        self.broken
            .iter()
            .filter(|b| b.table == table)
            .map(|b| b.constraint.clone())
            .collect()
    }
}

/// Directed graph of foreign-key dependencies over a table set.
///
/// An edge points from a table to a table its foreign keys reference.
/// Foreign keys referencing tables outside the set are ignored for ordering;
/// self-references are not edges.
#[derive(Debug)]
pub struct DependencyGraph {
    /// table -> set of tables it depends on (must be created first).
    deps: BTreeMap<String, BTreeSet<String>>,

    /// (table, referenced table) -> constraint names forming that edge.
    edge_constraints: BTreeMap<(String, String), Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph from descriptors, restricted to the given set.
    pub fn build<'a, I>(tables: I) -> Self
    where
        I: IntoIterator<Item = &'a TableDescriptor>,
    {
        let tables: Vec<&TableDescriptor> = tables.into_iter().collect();
        let names: BTreeSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();

        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut edge_constraints: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();

        for table in &tables {
            let entry = deps.entry(table.name.clone()).or_default();
            for fk in &table.foreign_keys {
                if fk.is_self_reference(&table.name) || !names.contains(fk.ref_table.as_str()) {
                    continue;
                }
                entry.insert(fk.ref_table.clone());
                edge_constraints
                    .entry((table.name.clone(), fk.ref_table.clone()))
                    .or_default()
                    .push(fk.name.clone());
            }
        }

        Self {
            deps,
            edge_constraints,
        }
    }

    /// Resolve a creation order via Kahn's algorithm.
    ///
    /// When the remaining subgraph has no dependency-free table (a true
    /// multi-table cycle), the alphabetically smallest remaining table has
    /// its outstanding foreign keys marked as cycle-broken and is released;
    /// the sort then continues. The resolver therefore always terminates
    /// with a complete order.
    pub fn resolve(&self) -> Resolution {
        let mut remaining: BTreeMap<String, BTreeSet<String>> = self.deps.clone();
        let mut creation_order = Vec::with_capacity(remaining.len());
        let mut broken = Vec::new();

        while !remaining.is_empty() {
            // BTreeMap iteration gives the smallest-named ready table first.
            let ready = remaining
                .iter()
                .find(|(_, deps)| deps.is_empty())
                .map(|(name, _)| name.clone());

            let name = match ready {
                Some(name) => name,
                None => {
                    // Cycle: release the smallest remaining table by breaking
                    // its outstanding edges.
                    let (name, deps) = remaining
                        .iter()
                        .next()
                        .map(|(n, d)| (n.clone(), d.clone()))
                        .expect("remaining is non-empty");

                    for ref_table in &deps {
                        if let Some(constraints) = self
                            .edge_constraints
                            .get(&(name.clone(), ref_table.clone()))
                        {
                            for constraint in constraints {
                                broken.push(BrokenConstraint {
                                    table: name.clone(),
                                    constraint: constraint.clone(),
                                    ref_table: ref_table.clone(),
                                });
                            }
                        }
                    }
                    remaining.get_mut(&name).expect("present").clear();
                    name
                }
            };

            remaining.remove(&name);
            for deps in remaining.values_mut() {
                deps.remove(&name);
            }
            creation_order.push(name);
        }

        Resolution {
            creation_order,
            broken,
        }
    }
}

/// One table's planned actions.
#[derive(Debug, Clone)]
pub struct TableAction {
    /// Table name.
    pub table: String,

    /// Whether data is copied after the structure exists.
    pub sync_data: bool,

    /// Constraints to omit at creation time (cycle-broken).
    pub skip_constraints: BTreeSet<String>,
}

/// Ordered list of per-table actions for one run. Created once, consumed
/// once, never persisted.
#[derive(Debug, Clone)]
pub struct ReplicationPlan {
    /// Actions in creation order.
    pub actions: Vec<TableAction>,

    /// Cycle-broken constraints for the whole run.
    pub broken: Vec<BrokenConstraint>,
}

impl ReplicationPlan {
    /// Derive the plan from a replication set and a dependency resolution.
    pub fn build(set: &ReplicationSet, resolution: &Resolution) -> Self {
        let actions = resolution
            .creation_order
            .iter()
            .map(|name| TableAction {
                table: name.clone(),
                sync_data: set.full_sync.contains(name),
                skip_constraints: resolution.skipped_constraints(name),
            })
            .collect();

        Self {
            actions,
            broken: resolution.broken.clone(),
        }
    }

    /// Warnings for every cycle-broken constraint in the plan.
    pub fn cycle_warnings(&self) -> Vec<RunWarning> {
        self.broken
            .iter()
            .map(|b| {
                RunWarning::for_constraint(
                    WarningKind::CycleBroken,
                    b.table.clone(),
                    b.constraint.clone(),
                    format!(
                        "foreign key {} ({} -> {}) temporarily removed to break a dependency cycle",
                        b.constraint, b.table, b.ref_table
                    ),
                )
            })
            .collect()
    }
}
