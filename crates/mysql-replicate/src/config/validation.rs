//! Configuration validation.

use super::Config;
use crate::error::{ReplicateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.environments.is_empty() {
        return Err(ReplicateError::Config(
            "at least one environment is required".into(),
        ));
    }

    for (name, env) in &config.environments {
        if env.host.is_empty() {
            return Err(ReplicateError::Config(format!(
                "environments.{}.host is required",
                name
            )));
        }
        if env.database.is_empty() {
            return Err(ReplicateError::Config(format!(
                "environments.{}.database is required",
                name
            )));
        }
        if env.user.is_empty() {
            return Err(ReplicateError::Config(format!(
                "environments.{}.user is required",
                name
            )));
        }
        if env.port == 0 {
            return Err(ReplicateError::Config(format!(
                "environments.{}.port must be non-zero",
                name
            )));
        }
    }

    if config.replication.batch_size == 0 {
        return Err(ReplicateError::Config(
            "replication.batch_size must be at least 1".into(),
        ));
    }
    if config.replication.workers == 0 {
        return Err(ReplicateError::Config(
            "replication.workers must be at least 1".into(),
        ));
    }
    if config.replication.read_ahead_batches == 0 {
        return Err(ReplicateError::Config(
            "replication.read_ahead_batches must be at least 1".into(),
        ));
    }

    if config.backup.keep_last == 0 {
        return Err(ReplicateError::Config(
            "backup.keep_last must be at least 1".into(),
        ));
    }

    // Duplicate names in the full-sync list are almost certainly a config
    // mistake; reject them rather than silently deduplicating.
    let mut seen = std::collections::BTreeSet::new();
    for table in &config.replication.full_sync_tables {
        if !seen.insert(table.as_str()) {
            return Err(ReplicateError::Config(format!(
                "replication.full_sync_tables lists '{}' more than once",
                table
            )));
        }
    }

    Ok(())
}
