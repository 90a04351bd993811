//! # mysql-replicate
//!
//! Point-in-time MySQL schema and data replication for refreshing a sandbox
//! database from production.
//!
//! - **Structure-preserving recreation**: tables are dropped and rebuilt with
//!   their exact declared column types, keys, and constraints
//! - **Dependency-aware ordering** with deterministic cycle breaking
//! - **Batched data transfer** that preserves literal values, including
//!   zero-valued auto-increment keys
//! - **Backup safety net**: the target is dumped (mysqldump or a native
//!   fallback) before any mutation, and restored if the run fails
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_replicate::{Config, Replicator};
//!
//! #[tokio::main]
//! async fn main() -> mysql_replicate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let replicator = Replicator::new(config);
//!     let result = replicator.run_replication("production", "sandbox").await?;
//!     println!("Copied {} rows across {} tables", result.rows_copied, result.tables_copied);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod plan;
pub mod replicate;
pub mod source;
pub mod target;

// Re-exports for convenient access
pub use backup::{
    BackupManager, BackupMetadata, BackupState, CaptureOptions, DumpSummary, RestoreOptions,
    RestoreReport,
};
pub use config::{BackupConfig, Config, EnvironmentConfig, ReplicationConfig};
pub use crate::core::{ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, TableDescriptor};
pub use error::{ReplicateError, Result};
pub use events::{EventSink, LogSink, NullSink, ReplicationEvent, RunWarning, WarningKind};
pub use orchestrator::{Orchestrator, ReplicationMode, RunResult, RunState};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// High-level entry point tying configuration, backups, and runs together.
///
/// At most one replication run may be active per target database; concurrent
/// attempts against the same target fail fast with
/// [`ReplicateError::RunInProgress`]. Different targets may run concurrently
/// from the same `Replicator`.
pub struct Replicator {
    config: Config,
    sink: Arc<dyn EventSink>,
    backups: Arc<BackupManager>,
    active_targets: Arc<Mutex<HashSet<String>>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Replicator {
    /// Create a replicator with the default log-forwarding event sink.
    pub fn new(config: Config) -> Self {
        Self::with_sink(config, Arc::new(LogSink))
    }

    /// Create a replicator with an injected event sink.
    pub fn with_sink(config: Config, sink: Arc<dyn EventSink>) -> Self {
        let backups = Arc::new(BackupManager::new(config.backup.clone(), Arc::clone(&sink)));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            config,
            sink,
            backups,
            active_targets: Arc::new(Mutex::new(HashSet::new())),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Replace the backup manager (custom store or strategies).
    pub fn with_backup_manager(mut self, backups: Arc<BackupManager>) -> Self {
        self.backups = backups;
        self
    }

    /// Request cancellation of all in-flight operations. They stop at the
    /// next batch or statement boundary; a run interrupted mid-mutation
    /// restores the target from its pre-run backup.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Run a full replication from `source_env` into `target_env`.
    ///
    /// A run that starts but fails is reported through the returned
    /// [`RunResult`] (`success == false`, error attached); `Err` is reserved
    /// for runs that never start, such as an unknown target environment or
    /// another run already active against the same target.
    pub async fn run_replication(&self, source_env: &str, target_env: &str) -> Result<RunResult> {
        self.run_replication_with_mode(source_env, target_env, ReplicationMode::Full)
            .await
    }

    /// Run a replication with an explicit mode.
    pub async fn run_replication_with_mode(
        &self,
        source_env: &str,
        target_env: &str,
        mode: ReplicationMode,
    ) -> Result<RunResult> {
        let target_key = self.config.environment(target_env)?.target_key();

        {
            let mut active = self
                .active_targets
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if !active.insert(target_key.clone()) {
                return Err(ReplicateError::RunInProgress { target: target_key });
            }
        }
        let _guard = TargetGuard {
            key: target_key,
            active: Arc::clone(&self.active_targets),
        };

        let orchestrator = Orchestrator::new(
            self.config.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.backups),
        );
        orchestrator
            .run(source_env, target_env, mode, self.cancel_rx.clone())
            .await
    }

    /// Capture a standalone backup of an environment.
    pub async fn create_backup(&self, env_name: &str, opts: CaptureOptions) -> Result<BackupMetadata> {
        let env = self.config.environment(env_name)?.clone();
        self.backups
            .create_backup(env_name, &env, opts, &self.cancel_rx)
            .await
    }

    /// All stored backups, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        self.backups.list_backups().await
    }

    /// Inspect a stored backup's contents.
    pub async fn analyze_backup(&self, id: &str) -> Result<DumpSummary> {
        self.backups.analyze_backup(id).await
    }

    /// Restore a backup into an environment.
    pub async fn restore_backup(
        &self,
        env_name: &str,
        id: &str,
        opts: RestoreOptions,
    ) -> Result<RestoreReport> {
        let env = self.config.environment(env_name)?.clone();

        let writer = target::MysqlWriter::connect(&env, 2).await?;
        let target_tables = writer.list_tables().await?;
        writer.close().await;

        self.backups
            .restore_backup(env_name, &env, id, &target_tables, opts, &self.cancel_rx)
            .await
    }
}

/// Releases the per-target run slot when the run finishes, panics included.
struct TargetGuard {
    key: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.key);
    }
}
