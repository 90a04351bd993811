//! Error types for the replication library.

use thiserror::Error;

/// Main error type for replication operations.
#[derive(Error, Debug)]
pub enum ReplicateError {
    /// Configuration error (invalid YAML, missing fields, unknown environment).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection-level error with context about where it occurred.
    #[error("Connectivity error: {message}\n  Context: {context}")]
    Connectivity { message: String, context: String },

    /// A named object (table, environment, backup artifact) does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Structural operation failed for a specific table.
    ///
    /// At the run level these degrade to warnings; the variant exists so a
    /// single table operation can report a typed failure to its caller.
    #[error("Structural conflict on table {table}: {message}")]
    Structural { table: String, message: String },

    /// Data transfer failed for a specific table.
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Backup capture failed. Fatal to the run: no destructive step proceeds
    /// without a verified backup.
    #[error("Backup error: {0}")]
    Backup(String),

    /// Restore operation failed.
    #[error("Restore error: {0}")]
    Restore(String),

    /// Another run is already active against the same target.
    #[error("A replication run is already active for target {target}")]
    RunInProgress { target: String },

    /// Source database error (sqlx).
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// Target database error (mysql_async).
    #[error("Target database error: {0}")]
    Target(#[from] mysql_async::Error),

    /// IO error (dump files, metadata sidecars).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error (artifact metadata, results).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

impl ReplicateError {
    /// Create a Connectivity error with context about where it occurred.
    pub fn connectivity(message: impl ToString, context: impl Into<String>) -> Self {
        ReplicateError::Connectivity {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Structural error.
    pub fn structural(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicateError::Structural {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Transfer error.
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a NotFound error for a table.
    pub fn table_not_found(name: impl Into<String>) -> Self {
        ReplicateError::NotFound {
            kind: "Table",
            name: name.into(),
        }
    }

    /// Whether this error is fatal to the whole run (as opposed to a
    /// per-table issue that degrades to a warning).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ReplicateError::Structural { .. } | ReplicateError::Transfer { .. }
        )
    }
}

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReplicateError::structural("users", "duplicate key name");
        assert_eq!(
            err.to_string(),
            "Structural conflict on table users: duplicate key name"
        );

        let err = ReplicateError::table_not_found("missing");
        assert_eq!(err.to_string(), "Table not found: missing");
    }

    #[test]
    fn test_fatality_classification() {
        assert!(!ReplicateError::structural("t", "m").is_fatal());
        assert!(!ReplicateError::transfer("t", "m").is_fatal());
        assert!(ReplicateError::Backup("disk full".into()).is_fatal());
        assert!(ReplicateError::Cancelled.is_fatal());
        assert!(ReplicateError::Config("bad".into()).is_fatal());
    }
}
