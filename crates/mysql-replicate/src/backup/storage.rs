//! Backup artifact storage: gzip dump files with JSON metadata sidecars.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backup::analyze::DumpSummary;
use crate::error::{ReplicateError, Result};

/// Metadata describing one backup artifact, persisted as a `.meta` JSON
/// sidecar next to the dump file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Artifact identifier; also the dump file stem.
    pub id: String,

    /// Capture time.
    pub created_at: DateTime<Utc>,

    /// Environment name the backup was taken from.
    pub environment: String,

    /// Database name.
    pub database: String,

    /// Strategy that produced the dump ("mysqldump" or "native").
    pub strategy: String,

    /// Compressed artifact size in bytes.
    pub size_bytes: u64,

    /// Whether the dump contains structure only (no row data).
    pub structure_only: bool,

    /// Content summary taken right after capture.
    #[serde(default)]
    pub summary: DumpSummary,
}

/// Storage backend for backup artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Path the dump file for an artifact id lives (or will live) at.
    fn artifact_path(&self, id: &str) -> PathBuf;

    /// Persist metadata for a captured artifact.
    async fn save_metadata(&self, meta: &BackupMetadata) -> Result<()>;

    /// Load metadata by artifact id.
    async fn load_metadata(&self, id: &str) -> Result<BackupMetadata>;

    /// All stored artifacts, newest first.
    async fn list(&self) -> Result<Vec<BackupMetadata>>;

    /// Remove one artifact and its metadata.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Apply retention: keep the newest `keep_last` artifacts and drop
    /// anything older than `max_age_days`. Returns removed ids.
    async fn prune(&self, keep_last: usize, max_age_days: Option<u32>) -> Result<Vec<String>>;
}

/// Filesystem-backed artifact store.
///
/// Layout: `<dir>/<id>.sql.gz` plus `<dir>/<id>.meta`.
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta", id))
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn artifact_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.sql.gz", id))
    }

    async fn save_metadata(&self, meta: &BackupMetadata) -> Result<()> {
        self.ensure_dir().await?;
        let json = serde_json::to_string_pretty(meta)?;
        tokio::fs::write(self.meta_path(&meta.id), json).await?;
        debug!(id = %meta.id, "saved backup metadata");
        Ok(())
    }

    async fn load_metadata(&self, id: &str) -> Result<BackupMetadata> {
        let path = self.meta_path(id);
        if !path.exists() {
            return Err(ReplicateError::NotFound {
                kind: "Backup",
                name: id.to_string(),
            });
        }
        let json = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn list(&self) -> Result<Vec<BackupMetadata>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut metas = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let json = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<BackupMetadata>(&json) {
                Ok(meta) => metas.push(meta),
                Err(e) => {
                    // A corrupt sidecar must not hide the other backups.
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable metadata");
                }
            }
        }

        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(metas)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let artifact = self.artifact_path(id);
        if artifact.exists() {
            tokio::fs::remove_file(&artifact).await?;
        }
        let meta = self.meta_path(id);
        if meta.exists() {
            tokio::fs::remove_file(&meta).await?;
        }
        Ok(())
    }

    async fn prune(&self, keep_last: usize, max_age_days: Option<u32>) -> Result<Vec<String>> {
        let metas = self.list().await?;
        let cutoff = max_age_days.map(|days| Utc::now() - Duration::days(days as i64));

        let mut removed = Vec::new();
        for (i, meta) in metas.iter().enumerate() {
            let too_many = i >= keep_last;
            let too_old = cutoff.is_some_and(|c| meta.created_at < c);
            if too_many || too_old {
                self.remove(&meta.id).await?;
                removed.push(meta.id.clone());
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned backup artifacts");
        }
        Ok(removed)
    }
}

/// Build a backup artifact id from the environment and capture time.
pub fn make_artifact_id(database: &str, environment: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        database,
        environment,
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Dump file size helper used when finalizing metadata.
pub async fn file_size(path: &Path) -> Result<u64> {
    Ok(tokio::fs::metadata(path).await?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(id: &str, created_at: DateTime<Utc>) -> BackupMetadata {
        BackupMetadata {
            id: id.to_string(),
            created_at,
            environment: "sandbox".to_string(),
            database: "app".to_string(),
            strategy: "mysqldump".to_string(),
            size_bytes: 1024,
            structure_only: false,
            summary: DumpSummary::default(),
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_make_artifact_id() {
        assert_eq!(
            make_artifact_id("app", "sandbox", at(9)),
            "app_sandbox_20260801_090000"
        );
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        let m = meta("b1", at(9));
        store.save_metadata(&m).await.unwrap();

        let loaded = store.load_metadata("b1").await.unwrap();
        assert_eq!(loaded.id, "b1");
        assert_eq!(loaded.database, "app");
        assert_eq!(loaded.created_at, at(9));
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let err = store.load_metadata("missing").await.unwrap_err();
        assert!(err.to_string().contains("Backup not found"));
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        store.save_metadata(&meta("old", at(8))).await.unwrap();
        store.save_metadata(&meta("new", at(12))).await.unwrap();
        store.save_metadata(&meta("mid", at(10))).await.unwrap();

        let listed = store.list().await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        for (id, hour) in [("a", 8), ("b", 9), ("c", 10), ("d", 11)] {
            store.save_metadata(&meta(id, at(hour))).await.unwrap();
            tokio::fs::write(store.artifact_path(id), b"dump").await.unwrap();
        }

        let removed = store.prune(2, None).await.unwrap();
        assert_eq!(removed, vec!["b", "a"]);

        let remaining = store.list().await.unwrap();
        let ids: Vec<&str> = remaining.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c"]);
        assert!(!store.artifact_path("a").exists());
        assert!(store.artifact_path("d").exists());
    }

    #[tokio::test]
    async fn test_prune_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        let ancient = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        store.save_metadata(&meta("ancient", ancient)).await.unwrap();
        store.save_metadata(&meta("recent", Utc::now())).await.unwrap();

        let removed = store.prune(10, Some(30)).await.unwrap();
        assert_eq!(removed, vec!["ancient"]);
    }
}
