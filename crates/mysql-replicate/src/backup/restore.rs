//! Restore options and pre-restore compatibility checks.

use serde::{Deserialize, Serialize};

use crate::events::{RunWarning, WarningKind};

/// Options controlling a restore.
#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Report what would happen without executing the dump.
    pub dry_run: bool,

    /// Treat any compatibility difference as an error instead of a warning.
    pub strict: bool,

    /// Capture a snapshot of the target before replaying the dump. On by
    /// default so a restore can itself be undone.
    pub safety_backup: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            strict: false,
            safety_backup: true,
        }
    }
}

/// Result of a restore (or a dry run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Artifact that was (or would be) restored.
    pub artifact_id: String,

    /// Whether this was a dry run.
    pub dry_run: bool,

    /// Compatibility warnings found before the restore.
    pub warnings: Vec<RunWarning>,

    /// Id of the safety snapshot captured before the restore, if any.
    pub safety_backup: Option<String>,

    /// Tables the dump recreates.
    pub tables: Vec<String>,
}

/// Compare the table set in a dump against the tables currently on the
/// target.
///
/// A dump replays with DROP TABLE IF EXISTS per dumped table, so dump-only
/// tables are created and target-only tables are left untouched with their
/// current data; both differences are surfaced so the operator knows the
/// restore does not produce an exact copy of the dumped database.
pub fn compatibility_warnings(dump_tables: &[String], target_tables: &[String]) -> Vec<RunWarning> {
    let mut warnings = Vec::new();

    for table in dump_tables {
        if !target_tables.contains(table) {
            warnings.push(RunWarning::for_table(
                WarningKind::RestoreCompatibility,
                table.clone(),
                format!("table '{}' exists in the dump but not on the target; it will be created", table),
            ));
        }
    }
    for table in target_tables {
        if !dump_tables.contains(table) {
            warnings.push(RunWarning::for_table(
                WarningKind::RestoreCompatibility,
                table.clone(),
                format!(
                    "table '{}' exists on the target but not in the dump; it will keep its current data",
                    table
                ),
            ));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_matching_sets_produce_no_warnings() {
        let tables = names(&["a", "b"]);
        assert!(compatibility_warnings(&tables, &tables).is_empty());
    }

    #[test]
    fn test_dump_only_and_target_only_tables_flagged() {
        let warnings =
            compatibility_warnings(&names(&["a", "new"]), &names(&["a", "legacy"]));
        assert_eq!(warnings.len(), 2);
        assert!(warnings
            .iter()
            .all(|w| w.kind == WarningKind::RestoreCompatibility));
        assert!(warnings[0].message.contains("'new'"));
        assert!(warnings[1].message.contains("'legacy'"));
    }
}
