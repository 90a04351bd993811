//! Backup lifecycle: capture, retention, inspection, and restore.

mod analyze;
mod restore;
mod storage;
mod strategy;

pub use analyze::{analyze_dump, analyze_file, DumpSummary};
pub use restore::{compatibility_warnings, RestoreOptions, RestoreReport};
pub use storage::{file_size, make_artifact_id, ArtifactStore, BackupMetadata, FsArtifactStore};
pub use strategy::{
    pick_strategy, split_statements, BackupStrategy, CaptureOptions, MysqldumpStrategy,
    NativeDumpStrategy,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{BackupConfig, EnvironmentConfig};
use crate::error::{ReplicateError, Result};
use crate::events::{EventSink, ReplicationEvent};

/// Backup subsystem state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Idle,
    Capturing,
    Captured,
    Restoring,
    Restored,
    Failed,
}

impl BackupState {
    /// Whether a new capture or restore may start from this state.
    fn is_settled(self) -> bool {
        !matches!(self, BackupState::Capturing | BackupState::Restoring)
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupState::Idle => "idle",
            BackupState::Capturing => "capturing",
            BackupState::Captured => "captured",
            BackupState::Restoring => "restoring",
            BackupState::Restored => "restored",
            BackupState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Coordinates backup capture, storage, retention, and restore.
///
/// State is tracked per environment: captures and restores against different
/// environments proceed concurrently, while a second operation against an
/// environment with one in flight fails fast.
pub struct BackupManager {
    config: BackupConfig,
    store: Arc<dyn ArtifactStore>,
    strategies: Vec<Arc<dyn BackupStrategy>>,
    sink: Arc<dyn EventSink>,
    states: Mutex<HashMap<String, BackupState>>,
}

impl BackupManager {
    /// Create a manager with the default filesystem store and the standard
    /// strategy preference order (mysqldump first, native fallback).
    pub fn new(config: BackupConfig, sink: Arc<dyn EventSink>) -> Self {
        let store = Arc::new(FsArtifactStore::new(config.dir.clone()));
        Self {
            config,
            store,
            strategies: vec![
                Arc::new(MysqldumpStrategy),
                Arc::new(NativeDumpStrategy::default()),
            ],
            sink,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the artifact store.
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the strategy preference list.
    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn BackupStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Current state for one environment.
    pub fn state(&self, env_name: &str) -> BackupState {
        let states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        states.get(env_name).copied().unwrap_or(BackupState::Idle)
    }

    fn transition(&self, env_name: &str, to: BackupState) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let state = states.entry(env_name.to_string()).or_insert(BackupState::Idle);
        debug!(env = env_name, from = %state, to = %to, "backup state change");
        *state = to;
    }

    fn begin(&self, env_name: &str, to: BackupState) -> Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let state = states.entry(env_name.to_string()).or_insert(BackupState::Idle);
        if !state.is_settled() {
            return Err(ReplicateError::Backup(format!(
                "a backup operation is already in progress for {} (state: {})",
                env_name, state
            )));
        }
        debug!(env = env_name, from = %state, to = %to, "backup state change");
        *state = to;
        Ok(())
    }

    /// Capture a backup of an environment, persist its metadata, and apply
    /// retention.
    pub async fn create_backup(
        &self,
        env_name: &str,
        env: &EnvironmentConfig,
        opts: CaptureOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<BackupMetadata> {
        self.begin(env_name, BackupState::Capturing)?;

        let result = self.capture_inner(env_name, env, opts, cancel).await;
        match &result {
            Ok(meta) => {
                info!(id = %meta.id, strategy = %meta.strategy, size = meta.size_bytes, "backup captured");
                self.transition(env_name, BackupState::Captured);
            }
            Err(_) => self.transition(env_name, BackupState::Failed),
        }
        result
    }

    async fn capture_inner(
        &self,
        env_name: &str,
        env: &EnvironmentConfig,
        opts: CaptureOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<BackupMetadata> {
        let strategy = pick_strategy(&self.strategies).await?;

        let created_at = Utc::now();
        let id = make_artifact_id(&env.database, env_name, created_at);
        let dest = self.store.artifact_path(&id);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        strategy.capture(env, opts, &dest, cancel).await?;

        let analyze_path = dest.clone();
        let summary = tokio::task::spawn_blocking(move || analyze_file(&analyze_path))
            .await
            .map_err(|e| ReplicateError::Backup(format!("analyze task failed: {}", e)))??;

        let meta = BackupMetadata {
            id: id.clone(),
            created_at,
            environment: env_name.to_string(),
            database: env.database.clone(),
            strategy: strategy.name().to_string(),
            size_bytes: file_size(&dest).await?,
            structure_only: opts.structure_only,
            summary,
        };
        self.store.save_metadata(&meta).await?;

        self.sink.emit(&ReplicationEvent::BackupCreated {
            artifact_id: meta.id.clone(),
            size_bytes: meta.size_bytes,
        });

        // Retention is best effort; a prune failure never blocks the capture.
        if let Err(e) = self
            .store
            .prune(self.config.keep_last, self.config.max_age_days)
            .await
        {
            warn!(error = %e, "backup retention pruning failed");
        }

        Ok(meta)
    }

    /// All stored backups, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        self.store.list().await
    }

    /// Metadata for one backup.
    pub async fn get_backup(&self, id: &str) -> Result<BackupMetadata> {
        self.store.load_metadata(id).await
    }

    /// Inspect a stored dump's contents.
    pub async fn analyze_backup(&self, id: &str) -> Result<DumpSummary> {
        // Make sure the id is known before touching the file.
        self.store.load_metadata(id).await?;
        let path = self.store.artifact_path(id);
        if !path.exists() {
            return Err(ReplicateError::NotFound {
                kind: "Backup",
                name: id.to_string(),
            });
        }
        tokio::task::spawn_blocking(move || analyze_file(&path))
            .await
            .map_err(|e| ReplicateError::Backup(format!("analyze task failed: {}", e)))?
    }

    /// Restore a backup against an environment.
    ///
    /// Compatibility between the dump's table set and `target_tables` is
    /// checked first; in strict mode any difference aborts the restore. When
    /// requested, a safety snapshot of the target is captured before the
    /// dump replays, so even a restore can be undone.
    pub async fn restore_backup(
        &self,
        env_name: &str,
        env: &EnvironmentConfig,
        id: &str,
        target_tables: &[String],
        opts: RestoreOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RestoreReport> {
        let meta = self.store.load_metadata(id).await?;
        let summary = self.analyze_backup(id).await?;

        let warnings = compatibility_warnings(&summary.tables, target_tables);
        for warning in &warnings {
            self.sink
                .emit(&ReplicationEvent::WarningRaised(warning.clone()));
        }
        if opts.strict && !warnings.is_empty() {
            return Err(ReplicateError::Restore(format!(
                "strict mode: {} compatibility difference(s) between dump and target",
                warnings.len()
            )));
        }

        if opts.dry_run {
            return Ok(RestoreReport {
                artifact_id: id.to_string(),
                dry_run: true,
                warnings,
                safety_backup: None,
                tables: summary.tables,
            });
        }

        let safety_backup = if opts.safety_backup {
            let snapshot = self
                .create_backup(env_name, env, CaptureOptions::default(), cancel)
                .await?;
            Some(snapshot.id)
        } else {
            None
        };

        let strategy = self
            .strategies
            .iter()
            .find(|s| s.name() == meta.strategy)
            .cloned()
            .ok_or_else(|| {
                ReplicateError::Restore(format!(
                    "backup {} was captured with unknown strategy '{}'",
                    id, meta.strategy
                ))
            })?;
        if !strategy.is_available().await {
            return Err(ReplicateError::Restore(format!(
                "strategy '{}' required by backup {} is not available on this host",
                meta.strategy, id
            )));
        }

        self.begin(env_name, BackupState::Restoring)?;
        let artifact = self.store.artifact_path(id);
        match strategy.restore(env, &artifact, cancel).await {
            Ok(()) => {
                self.transition(env_name, BackupState::Restored);
                info!(id, env = env_name, "backup restored");
                Ok(RestoreReport {
                    artifact_id: id.to_string(),
                    dry_run: false,
                    warnings,
                    safety_backup,
                    tables: summary.tables,
                })
            }
            Err(e) => {
                self.transition(env_name, BackupState::Failed);
                if let Some(snapshot_id) = &safety_backup {
                    self.replay_safety_snapshot(env, snapshot_id, cancel).await;
                }
                Err(e)
            }
        }
    }

    /// A failed restore may have left the target partially overwritten, so
    /// replay the safety snapshot captured just before it. Best effort: the
    /// original restore failure is what the caller sees either way.
    async fn replay_safety_snapshot(
        &self,
        env: &EnvironmentConfig,
        snapshot_id: &str,
        cancel: &watch::Receiver<bool>,
    ) {
        warn!(id = snapshot_id, "restore failed; replaying pre-restore safety snapshot");

        let result = async {
            let meta = self.store.load_metadata(snapshot_id).await?;
            let strategy = self
                .strategies
                .iter()
                .find(|s| s.name() == meta.strategy)
                .cloned()
                .ok_or_else(|| {
                    ReplicateError::Restore(format!(
                        "snapshot {} was captured with unknown strategy '{}'",
                        snapshot_id, meta.strategy
                    ))
                })?;
            let artifact = self.store.artifact_path(snapshot_id);
            strategy.restore(env, &artifact, cancel).await
        }
        .await;

        match result {
            Ok(()) => info!(id = snapshot_id, "safety snapshot restored"),
            Err(e) => {
                tracing::error!(id = snapshot_id, error = %e, "safety snapshot restore failed; target may be inconsistent")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Strategy that writes a fixed gzip dump, for exercising the manager
    /// without a database or client tools.
    struct FixedDumpStrategy {
        captures: AtomicUsize,
        restores: AtomicUsize,
    }

    impl FixedDumpStrategy {
        fn new() -> Self {
            Self {
                captures: AtomicUsize::new(0),
                restores: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BackupStrategy for FixedDumpStrategy {
        fn name(&self) -> &'static str {
            "native"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn capture(
            &self,
            _env: &EnvironmentConfig,
            _opts: CaptureOptions,
            dest: &Path,
            _cancel: &watch::Receiver<bool>,
        ) -> Result<()> {
            use flate2::write::GzEncoder;
            use flate2::Compression;
            use std::io::Write;

            self.captures.fetch_add(1, Ordering::SeqCst);
            let file = std::fs::File::create(dest)?;
            let mut enc = GzEncoder::new(file, Compression::default());
            enc.write_all(b"CREATE TABLE `users` (\n `id` int\n);\nINSERT INTO `users` VALUES (1);\n")?;
            enc.finish()?;
            Ok(())
        }

        async fn restore(
            &self,
            _env: &EnvironmentConfig,
            _artifact: &Path,
            _cancel: &watch::Receiver<bool>,
        ) -> Result<()> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn env() -> EnvironmentConfig {
        EnvironmentConfig {
            host: "localhost".to_string(),
            port: 3306,
            database: "app".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
            charset: "utf8mb4".to_string(),
        }
    }

    fn manager(dir: &Path) -> (BackupManager, Arc<FixedDumpStrategy>) {
        let strategy = Arc::new(FixedDumpStrategy::new());
        let config = BackupConfig {
            dir: dir.to_path_buf(),
            keep_last: 10,
            max_age_days: None,
        };
        let manager = BackupManager::new(config, Arc::new(NullSink))
            .with_strategies(vec![strategy.clone() as Arc<dyn BackupStrategy>]);
        (manager, strategy)
    }

    #[tokio::test]
    async fn test_capture_persists_metadata_and_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, strategy) = manager(dir.path());
        let (_tx, cancel) = watch::channel(false);

        assert_eq!(manager.state("sandbox"), BackupState::Idle);
        let meta = manager
            .create_backup("sandbox", &env(), CaptureOptions::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(manager.state("sandbox"), BackupState::Captured);
        assert_eq!(strategy.captures.load(Ordering::SeqCst), 1);
        assert_eq!(meta.environment, "sandbox");
        assert_eq!(meta.strategy, "native");
        assert!(meta.size_bytes > 0);

        let listed = manager.list_backups().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, meta.id);
    }

    #[tokio::test]
    async fn test_capture_succeeds_when_prune_fails() {
        /// Delegates to a real store but refuses to prune.
        struct PruneFailingStore(FsArtifactStore);

        #[async_trait]
        impl ArtifactStore for PruneFailingStore {
            fn artifact_path(&self, id: &str) -> std::path::PathBuf {
                self.0.artifact_path(id)
            }

            async fn save_metadata(&self, meta: &BackupMetadata) -> Result<()> {
                self.0.save_metadata(meta).await
            }

            async fn load_metadata(&self, id: &str) -> Result<BackupMetadata> {
                self.0.load_metadata(id).await
            }

            async fn list(&self) -> Result<Vec<BackupMetadata>> {
                self.0.list().await
            }

            async fn remove(&self, id: &str) -> Result<()> {
                self.0.remove(id).await
            }

            async fn prune(&self, _keep_last: usize, _max_age_days: Option<u32>) -> Result<Vec<String>> {
                Err(ReplicateError::Backup("retention directory unreadable".into()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let manager = manager.with_store(Arc::new(PruneFailingStore(FsArtifactStore::new(
            dir.path(),
        ))));
        let (_tx, cancel) = watch::channel(false);

        let meta = manager
            .create_backup("sandbox", &env(), CaptureOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(manager.state("sandbox"), BackupState::Captured);
        assert!(manager.get_backup(&meta.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_captures_for_different_environments_run_concurrently() {
        use tokio::sync::Barrier;

        /// Blocks inside capture until both participants arrive, so the test
        /// only passes if two captures are in flight at once.
        struct RendezvousStrategy {
            barrier: Arc<Barrier>,
        }

        #[async_trait]
        impl BackupStrategy for RendezvousStrategy {
            fn name(&self) -> &'static str {
                "native"
            }

            async fn is_available(&self) -> bool {
                true
            }

            async fn capture(
                &self,
                _env: &EnvironmentConfig,
                _opts: CaptureOptions,
                dest: &Path,
                _cancel: &watch::Receiver<bool>,
            ) -> Result<()> {
                self.barrier.wait().await;

                use flate2::write::GzEncoder;
                use flate2::Compression;
                use std::io::Write;
                let file = std::fs::File::create(dest)?;
                let mut enc = GzEncoder::new(file, Compression::default());
                enc.write_all(b"CREATE TABLE `t` (\n `id` int\n);\n")?;
                enc.finish()?;
                Ok(())
            }

            async fn restore(
                &self,
                _env: &EnvironmentConfig,
                _artifact: &Path,
                _cancel: &watch::Receiver<bool>,
            ) -> Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let config = BackupConfig {
            dir: dir.path().to_path_buf(),
            keep_last: 10,
            max_age_days: None,
        };
        let manager = Arc::new(
            BackupManager::new(config, Arc::new(NullSink)).with_strategies(vec![Arc::new(
                RendezvousStrategy {
                    barrier: barrier.clone(),
                },
            )
                as Arc<dyn BackupStrategy>]),
        );
        let (_tx, cancel) = watch::channel(false);

        let mut prod_env = env();
        prod_env.database = "app_prod".to_string();

        let a = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .create_backup("sandbox", &env(), CaptureOptions::default(), &cancel)
                    .await
            })
        };
        let b = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .create_backup("production", &prod_env, CaptureOptions::default(), &cancel)
                    .await
            })
        };

        let results = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            (a.await.unwrap(), b.await.unwrap())
        })
        .await
        .expect("captures deadlocked instead of running concurrently");

        assert!(results.0.is_ok());
        assert!(results.1.is_ok());
        assert_eq!(manager.state("sandbox"), BackupState::Captured);
        assert_eq!(manager.state("production"), BackupState::Captured);
    }

    #[tokio::test]
    async fn test_analyze_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let (_tx, cancel) = watch::channel(false);

        let meta = manager
            .create_backup("sandbox", &env(), CaptureOptions::default(), &cancel)
            .await
            .unwrap();

        let summary = manager.analyze_backup(&meta.id).await.unwrap();
        assert_eq!(summary.tables, vec!["users"]);
        assert_eq!(summary.insert_statements, 1);
        assert!(!summary.structure_only);
    }

    #[tokio::test]
    async fn test_restore_dry_run_does_not_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, strategy) = manager(dir.path());
        let (_tx, cancel) = watch::channel(false);

        let meta = manager
            .create_backup("sandbox", &env(), CaptureOptions::default(), &cancel)
            .await
            .unwrap();

        let report = manager
            .restore_backup(
                "sandbox",
                &env(),
                &meta.id,
                &["users".to_string(), "extra".to_string()],
                RestoreOptions {
                    dry_run: true,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(strategy.restores.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restore_strict_rejects_differences() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let (_tx, cancel) = watch::channel(false);

        let meta = manager
            .create_backup("sandbox", &env(), CaptureOptions::default(), &cancel)
            .await
            .unwrap();

        let err = manager
            .restore_backup(
                "sandbox",
                &env(),
                &meta.id,
                &[],
                RestoreOptions {
                    strict: true,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("strict mode"));
    }

    #[tokio::test]
    async fn test_restore_takes_safety_snapshot_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, strategy) = manager(dir.path());
        let (_tx, cancel) = watch::channel(false);

        let meta = manager
            .create_backup("sandbox", &env(), CaptureOptions::default(), &cancel)
            .await
            .unwrap();

        let report = manager
            .restore_backup(
                "sandbox",
                &env(),
                &meta.id,
                &["users".to_string()],
                RestoreOptions::default(),
                &cancel,
            )
            .await
            .unwrap();

        assert!(report.safety_backup.is_some());
        assert_eq!(strategy.captures.load(Ordering::SeqCst), 2);
        assert_eq!(strategy.restores.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state("sandbox"), BackupState::Restored);
    }

    #[tokio::test]
    async fn test_failed_restore_replays_safety_snapshot() {
        /// Fails the first restore, succeeds on the replay.
        struct FlakyRestoreStrategy {
            restores: AtomicUsize,
        }

        #[async_trait]
        impl BackupStrategy for FlakyRestoreStrategy {
            fn name(&self) -> &'static str {
                "native"
            }

            async fn is_available(&self) -> bool {
                true
            }

            async fn capture(
                &self,
                _env: &EnvironmentConfig,
                _opts: CaptureOptions,
                dest: &Path,
                _cancel: &watch::Receiver<bool>,
            ) -> Result<()> {
                use flate2::write::GzEncoder;
                use flate2::Compression;
                use std::io::Write;

                let file = std::fs::File::create(dest)?;
                let mut enc = GzEncoder::new(file, Compression::default());
                enc.write_all(b"CREATE TABLE `users` (\n `id` int\n);\n")?;
                enc.finish()?;
                Ok(())
            }

            async fn restore(
                &self,
                _env: &EnvironmentConfig,
                _artifact: &Path,
                _cancel: &watch::Receiver<bool>,
            ) -> Result<()> {
                if self.restores.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ReplicateError::Restore("client exited with code 1".to_string()))
                } else {
                    Ok(())
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let strategy = Arc::new(FlakyRestoreStrategy {
            restores: AtomicUsize::new(0),
        });
        let config = BackupConfig {
            dir: dir.path().to_path_buf(),
            keep_last: 10,
            max_age_days: None,
        };
        let manager = BackupManager::new(config, Arc::new(NullSink))
            .with_strategies(vec![strategy.clone() as Arc<dyn BackupStrategy>]);
        let (_tx, cancel) = watch::channel(false);

        let meta = manager
            .create_backup("sandbox", &env(), CaptureOptions::default(), &cancel)
            .await
            .unwrap();

        let err = manager
            .restore_backup(
                "sandbox",
                &env(),
                &meta.id,
                &["users".to_string()],
                RestoreOptions::default(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("exited with code 1"));
        // One failed replay of the requested backup, one successful replay
        // of the safety snapshot.
        assert_eq!(strategy.restores.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restore_unknown_backup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let (_tx, cancel) = watch::channel(false);

        let err = manager
            .restore_backup(
                "sandbox",
                &env(),
                "missing",
                &[],
                RestoreOptions::default(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Backup not found"));
    }
}
