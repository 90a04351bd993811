//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure.
///
/// The core consumes this resolved, validated in-memory form; how it got
/// here (file, env, test fixture) is the caller's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named database environments (e.g. "production", "sandbox").
    pub environments: BTreeMap<String, EnvironmentConfig>,

    /// Replication behavior configuration.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Backup storage and retention configuration.
    #[serde(default)]
    pub backup: BackupConfig,
}

impl Config {
    /// Look up an environment by name.
    pub fn environment(&self, name: &str) -> crate::error::Result<&EnvironmentConfig> {
        self.environments.get(name).ok_or_else(|| {
            crate::error::ReplicateError::Config(format!(
                "environment '{}' not found in configuration",
                name
            ))
        })
    }
}

/// Connection settings for one database environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Connection character set (default: utf8mb4).
    #[serde(default = "default_charset")]
    pub charset: String,
}

impl EnvironmentConfig {
    /// Identity of the target this environment points at, used by the
    /// one-run-per-target guard.
    pub fn target_key(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Replication behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Tables replicated with structure and data. All other discovered
    /// tables are replicated structure-only.
    #[serde(default)]
    pub full_sync_tables: Vec<String>,

    /// Rows per read/insert batch (default: 2000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Parallel data-copy workers across independent tables (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bounded read-ahead depth of the per-table batch pipeline (default: 4).
    #[serde(default = "default_read_ahead")]
    pub read_ahead_batches: usize,

    /// Connection pool size per side (default: 8).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            full_sync_tables: Vec::new(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            read_ahead_batches: default_read_ahead(),
            max_connections: default_max_connections(),
        }
    }
}

/// Backup storage and retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory for backup artifacts (default: "backups").
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,

    /// Number of most recent artifacts to keep (default: 10).
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,

    /// Maximum artifact age in days. `None` means no age limit.
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            keep_last: default_keep_last(),
            max_age_days: None,
        }
    }
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_batch_size() -> usize {
    2_000
}

fn default_workers() -> usize {
    4
}

fn default_read_ahead() -> usize {
    4
}

fn default_max_connections() -> usize {
    8
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_keep_last() -> usize {
    10
}
