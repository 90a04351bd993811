//! Structured run events and the injected sink interface.
//!
//! The engine emits events through an [`EventSink`] handed to it at
//! construction; it never formats or persists them itself. The default
//! [`LogSink`] forwards everything to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a recoverable warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// A foreign key was temporarily removed to break a dependency cycle.
    CycleBroken,

    /// A constraint could not be attached and was skipped.
    StructuralConflict,

    /// A data-level decision that changes behavior outside this tool's
    /// control (zero-identity handling, count mismatches).
    DataIntegrity,

    /// A row count mismatch found during post-replication validation.
    RowCountMismatch,

    /// A configured full-sync table does not exist on the source.
    UnknownTable,

    /// A restore compatibility concern (table presence differences).
    RestoreCompatibility,
}

/// A recoverable issue recorded during a run.
///
/// Carries enough context (table, constraint, cause) to diagnose without
/// re-running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunWarning {
    /// Warning category.
    pub kind: WarningKind,

    /// Table the warning relates to, if any.
    pub table: Option<String>,

    /// Constraint name, for FK-related warnings.
    pub constraint: Option<String>,

    /// Human-readable description including the underlying cause.
    pub message: String,
}

impl RunWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: None,
            constraint: None,
            message: message.into(),
        }
    }

    pub fn for_table(kind: WarningKind, table: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: Some(table.into()),
            constraint: None,
            message: message.into(),
        }
    }

    pub fn for_constraint(
        kind: WarningKind,
        table: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            table: Some(table.into()),
            constraint: Some(constraint.into()),
            message: message.into(),
        }
    }
}

/// A structured event emitted during a run.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    /// A run began.
    RunStarted {
        run_id: String,
        source_env: String,
        target_env: String,
    },

    /// The run state machine advanced.
    StateChanged { run_id: String, state: String },

    /// A backup artifact was captured.
    BackupCreated {
        artifact_id: String,
        size_bytes: u64,
    },

    /// Work began on a table.
    TableStarted { table: String, with_data: bool },

    /// A table finished (structure, and data if requested).
    TableCompleted {
        table: String,
        rows: u64,
        /// False when the table's AUTO_INCREMENT attribute was removed on
        /// the target to preserve zero-valued keys.
        identity_preserved: bool,
    },

    /// A recoverable warning was raised.
    WarningRaised(RunWarning),

    /// The run finished.
    RunCompleted {
        run_id: String,
        success: bool,
        completed_at: DateTime<Utc>,
    },
}

/// Sink for structured run events.
///
/// Injected into the orchestrator; implementations may forward to logs,
/// metrics, or notification channels.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ReplicationEvent);
}

/// Default sink: forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &ReplicationEvent) {
        match event {
            ReplicationEvent::RunStarted {
                run_id,
                source_env,
                target_env,
            } => {
                tracing::info!(%run_id, %source_env, %target_env, "replication run started");
            }
            ReplicationEvent::StateChanged { run_id, state } => {
                tracing::debug!(%run_id, %state, "run state changed");
            }
            ReplicationEvent::BackupCreated {
                artifact_id,
                size_bytes,
            } => {
                tracing::info!(%artifact_id, size_bytes, "backup created");
            }
            ReplicationEvent::TableStarted { table, with_data } => {
                tracing::debug!(%table, with_data, "table started");
            }
            ReplicationEvent::TableCompleted {
                table,
                rows,
                identity_preserved,
            } => {
                tracing::info!(%table, rows, identity_preserved, "table completed");
            }
            ReplicationEvent::WarningRaised(warning) => {
                tracing::warn!(
                    kind = ?warning.kind,
                    table = warning.table.as_deref().unwrap_or("-"),
                    constraint = warning.constraint.as_deref().unwrap_or("-"),
                    "{}",
                    warning.message
                );
            }
            ReplicationEvent::RunCompleted {
                run_id, success, ..
            } => {
                tracing::info!(%run_id, success, "replication run completed");
            }
        }
    }
}

/// Sink that discards events. Useful in tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &ReplicationEvent) {}
}
