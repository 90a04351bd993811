//! Run orchestration: connect, back up, analyze, replicate, validate.
//!
//! A run only mutates the target after a verified backup exists; if the
//! mutation phase fails, the orchestrator restores that backup before
//! reporting the error.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::{BackupManager, CaptureOptions, RestoreOptions};
use crate::config::{Config, EnvironmentConfig};
use crate::error::{ReplicateError, Result};
use crate::events::{EventSink, ReplicationEvent, RunWarning, WarningKind};
use crate::plan::{DependencyGraph, ReplicationPlan, ReplicationSet};
use crate::replicate::execute_plan;
use crate::source::MysqlReader;
use crate::target::MysqlWriter;

/// What a run copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Recreate structure and copy data for configured full-sync tables.
    Full,

    /// Recreate structure only; no table data is copied.
    StructureOnly,
}

/// Phases of a replication run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Connecting,
    BackingUp,
    Analyzing,
    Replicating,
    Validating,
    Completed,
    Error,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Connecting => "connecting",
            RunState::BackingUp => "backing_up",
            RunState::Analyzing => "analyzing",
            RunState::Replicating => "replicating",
            RunState::Validating => "validating",
            RunState::Completed => "completed",
            RunState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Final report of one replication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Source environment name.
    pub source_env: String,

    /// Target environment name.
    pub target_env: String,

    /// Whether the run reached the completed state.
    pub success: bool,

    /// The error that stopped the run, when `success` is false.
    pub error: Option<String>,

    /// Tables whose structure was recreated.
    pub tables_recreated: usize,

    /// Tables whose data was copied.
    pub tables_copied: usize,

    /// Total rows written.
    pub rows_copied: u64,

    /// Backup captured before the target was touched.
    pub backup_id: Option<String>,

    /// All warnings raised during the run.
    pub warnings: Vec<RunWarning>,

    /// Run start time.
    pub started_at: DateTime<Utc>,

    /// Run completion time.
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    /// Wall-clock run duration in seconds.
    pub fn elapsed_secs(&self) -> i64 {
        (self.completed_at - self.started_at).num_seconds()
    }
}

/// Drives one replication run from connect to validate.
pub struct Orchestrator {
    config: Config,
    sink: Arc<dyn EventSink>,
    backups: Arc<BackupManager>,
}

impl Orchestrator {
    pub fn new(config: Config, sink: Arc<dyn EventSink>, backups: Arc<BackupManager>) -> Self {
        Self {
            config,
            sink,
            backups,
        }
    }

    fn set_state(&self, run_id: &str, state: RunState) {
        info!(run_id, state = %state, "run state");
        self.sink.emit(&ReplicationEvent::StateChanged {
            run_id: run_id.to_string(),
            state: state.to_string(),
        });
    }

    /// Execute a replication run from `source_env` into `target_env`.
    ///
    /// Always yields a [`RunResult`]: a failed run is reported with
    /// `success == false` and the originating error attached, along with the
    /// warnings and backup reference accumulated before the failure.
    pub async fn run(
        &self,
        source_env: &str,
        target_env: &str,
        mode: ReplicationMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunResult> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(run_id, source_env, target_env, mode = ?mode, "run starting");

        self.sink.emit(&ReplicationEvent::RunStarted {
            run_id: run_id.clone(),
            source_env: source_env.to_string(),
            target_env: target_env.to_string(),
        });

        let mut warnings: Vec<RunWarning> = Vec::new();
        let mut backup_id: Option<String> = None;
        let result = self
            .run_inner(
                &run_id,
                source_env,
                target_env,
                mode,
                cancel,
                &mut warnings,
                &mut backup_id,
            )
            .await;

        let completed_at = Utc::now();
        let (success, counts, error) = match result {
            Ok(counts) => {
                self.set_state(&run_id, RunState::Completed);
                (true, counts, None)
            }
            Err(e) => {
                self.set_state(&run_id, RunState::Error);
                error!(run_id, error = %e, "replication run failed");
                (false, (0, 0, 0), Some(e.to_string()))
            }
        };
        self.sink.emit(&ReplicationEvent::RunCompleted {
            run_id: run_id.clone(),
            success,
            completed_at,
        });

        let (tables_recreated, tables_copied, rows_copied) = counts;
        Ok(RunResult {
            run_id,
            source_env: source_env.to_string(),
            target_env: target_env.to_string(),
            success,
            error,
            tables_recreated,
            tables_copied,
            rows_copied,
            backup_id,
            warnings,
            started_at,
            completed_at,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inner(
        &self,
        run_id: &str,
        source_env: &str,
        target_env: &str,
        mode: ReplicationMode,
        cancel: watch::Receiver<bool>,
        warnings: &mut Vec<RunWarning>,
        backup_id: &mut Option<String>,
    ) -> Result<(usize, usize, u64)> {
        // Connect.
        self.set_state(run_id, RunState::Connecting);
        let source_cfg = self.config.environment(source_env)?.clone();
        let target_cfg = self.config.environment(target_env)?.clone();
        if source_cfg.target_key() == target_cfg.target_key() {
            return Err(ReplicateError::Config(format!(
                "source and target resolve to the same database: {}",
                source_cfg.target_key()
            )));
        }

        let max_conns = self.config.replication.max_connections;
        let reader = Arc::new(MysqlReader::connect(&source_cfg, max_conns).await?);
        let writer = Arc::new(MysqlWriter::connect(&target_cfg, max_conns).await?);

        let run = async {
            // Back up the target before any mutation.
            self.set_state(run_id, RunState::BackingUp);
            let backup = self
                .backups
                .create_backup(target_env, &target_cfg, CaptureOptions::default(), &cancel)
                .await?;
            *backup_id = Some(backup.id.clone());

            // Analyze the source and build the plan.
            self.set_state(run_id, RunState::Analyzing);
            let names = reader.list_tables().await?;
            let mut descriptors = Vec::with_capacity(names.len());
            for name in &names {
                descriptors.push(reader.describe_table(name).await?);
            }

            let requested_full_sync: &[String] = match mode {
                ReplicationMode::Full => &self.config.replication.full_sync_tables,
                ReplicationMode::StructureOnly => &[],
            };
            let set = ReplicationSet::partition(descriptors, requested_full_sync);
            for warning in set.warnings() {
                self.sink
                    .emit(&ReplicationEvent::WarningRaised(warning.clone()));
                warnings.push(warning);
            }

            let resolution = DependencyGraph::build(set.tables.values()).resolve();
            let plan = ReplicationPlan::build(&set, &resolution);
            for warning in plan.cycle_warnings() {
                self.sink
                    .emit(&ReplicationEvent::WarningRaised(warning.clone()));
                warnings.push(warning);
            }

            // Replicate. From here on the target is being mutated.
            self.set_state(run_id, RunState::Replicating);
            let replicate_result = execute_plan(
                Arc::clone(&reader),
                Arc::clone(&writer),
                &set,
                &plan,
                &self.config.replication,
                Arc::clone(&self.sink),
                cancel.clone(),
            )
            .await;

            let outcome = match replicate_result {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.rollback(target_env, &target_cfg, &backup.id, &writer).await;
                    return Err(e);
                }
            };
            warnings.extend(outcome.warnings.iter().cloned());

            // Validate. Mutation is done, so an unrecoverable error here
            // rolls back like a replication failure would.
            self.set_state(run_id, RunState::Validating);
            match self.validate(&reader, &target_cfg, &set).await {
                Ok(validation_warnings) => {
                    for warning in validation_warnings {
                        self.sink
                            .emit(&ReplicationEvent::WarningRaised(warning.clone()));
                        warnings.push(warning);
                    }
                }
                Err(e) => {
                    self.rollback(target_env, &target_cfg, &backup.id, &writer).await;
                    return Err(e);
                }
            }

            Ok((
                outcome.tables_recreated,
                outcome.tables_copied,
                outcome.rows_copied,
            ))
        }
        .await;

        reader.close().await;
        writer.close().await;
        run
    }

    /// Post-replication validation: re-read table presence on the target,
    /// and for full-sync tables compare column structure and row counts
    /// against the source. Differences degrade to warnings.
    async fn validate(
        &self,
        reader: &MysqlReader,
        target_cfg: &EnvironmentConfig,
        set: &ReplicationSet,
    ) -> Result<Vec<RunWarning>> {
        let mut warnings = Vec::new();
        let target = MysqlReader::connect(target_cfg, 2).await?;

        let check: Result<()> = async {
            let present: BTreeSet<String> = target.list_tables().await?.into_iter().collect();
            warnings.extend(presence_warnings(set.tables.keys(), &present));

            for table in &set.full_sync {
                if !present.contains(table) {
                    continue;
                }

                if let Some(source_desc) = set.tables.get(table) {
                    let target_desc = target.describe_table(table).await?;
                    for diff in source_desc.column_differences(&target_desc) {
                        warnings.push(RunWarning::for_table(
                            WarningKind::StructuralConflict,
                            table.clone(),
                            diff,
                        ));
                    }
                }

                let source_rows = reader.get_row_count(table).await?;
                let target_rows = target.get_row_count(table).await?;
                if source_rows != target_rows {
                    warnings.push(RunWarning::for_table(
                        WarningKind::RowCountMismatch,
                        table.clone(),
                        format!(
                            "row count mismatch: source has {}, target has {}",
                            source_rows, target_rows
                        ),
                    ));
                }
            }
            Ok(())
        }
        .await;

        target.close().await;
        check?;
        Ok(warnings)
    }

    /// Restore the pre-run backup after a mid-run failure. Best effort: the
    /// original failure is what the caller sees either way.
    async fn rollback(
        &self,
        target_env: &str,
        target_cfg: &EnvironmentConfig,
        backup_id: &str,
        writer: &MysqlWriter,
    ) {
        warn!(backup_id, "run failed after mutation began; restoring target from backup");

        // A fresh, never-cancelled receiver: the rollback must run even when
        // the failure was a cancellation.
        let (_tx, fresh_cancel) = watch::channel(false);

        let target_tables = writer.list_tables().await.unwrap_or_default();
        match self
            .backups
            .restore_backup(
                target_env,
                target_cfg,
                backup_id,
                &target_tables,
                RestoreOptions::default(),
                &fresh_cancel,
            )
            .await
        {
            Ok(_) => info!(backup_id, "target restored from pre-run backup"),
            Err(e) => error!(backup_id, error = %e, "rollback restore failed; target may be inconsistent"),
        }
    }
}

/// One warning per replicated table that is absent from the target.
fn presence_warnings<'a>(
    expected: impl IntoIterator<Item = &'a String>,
    present: &BTreeSet<String>,
) -> Vec<RunWarning> {
    expected
        .into_iter()
        .filter(|name| !present.contains(*name))
        .map(|name| {
            RunWarning::for_table(
                WarningKind::StructuralConflict,
                name.clone(),
                "table missing on target after replication",
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, ReplicationConfig};
    use crate::events::NullSink;
    use std::collections::BTreeMap;

    fn env(host: &str, database: &str) -> crate::config::EnvironmentConfig {
        crate::config::EnvironmentConfig {
            host: host.to_string(),
            port: 3306,
            database: database.to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
            charset: "utf8mb4".to_string(),
        }
    }

    fn orchestrator(environments: BTreeMap<String, crate::config::EnvironmentConfig>) -> Orchestrator {
        let config = Config {
            environments,
            replication: ReplicationConfig::default(),
            backup: BackupConfig::default(),
        };
        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
        let backups = Arc::new(BackupManager::new(
            config.backup.clone(),
            Arc::clone(&sink),
        ));
        Orchestrator::new(config, sink, backups)
    }

    #[tokio::test]
    async fn test_failed_run_yields_result_with_error() {
        let mut environments = BTreeMap::new();
        environments.insert("sandbox".to_string(), env("localhost", "app"));
        let orchestrator = orchestrator(environments);
        let (_tx, cancel) = watch::channel(false);

        let result = orchestrator
            .run("missing", "sandbox", ReplicationMode::Full, cancel)
            .await
            .unwrap();

        assert!(!result.success);
        let error = result.error.expect("failed run carries its error");
        assert!(error.contains("'missing' not found"));
        assert!(result.backup_id.is_none());
        assert!(result.warnings.is_empty());
        assert_eq!(result.rows_copied, 0);
    }

    #[test]
    fn test_presence_warnings_flag_missing_tables() {
        let expected = vec!["customers".to_string(), "orders".to_string()];
        let present: BTreeSet<String> = ["customers".to_string()].into_iter().collect();

        let warnings = presence_warnings(expected.iter(), &present);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].table.as_deref(), Some("orders"));
        assert_eq!(warnings[0].kind, WarningKind::StructuralConflict);
        assert!(warnings[0].message.contains("missing on target"));

        assert!(presence_warnings(expected.iter(), &expected.iter().cloned().collect()).is_empty());
    }

    #[tokio::test]
    async fn test_run_rejects_source_equal_to_target() {
        let mut environments = BTreeMap::new();
        environments.insert("a".to_string(), env("db1", "app"));
        environments.insert("b".to_string(), env("db1", "app"));
        let orchestrator = orchestrator(environments);
        let (_tx, cancel) = watch::channel(false);

        let result = orchestrator
            .run("a", "b", ReplicationMode::Full, cancel)
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result
            .error
            .expect("failed run carries its error")
            .contains("same database"));
    }
}
