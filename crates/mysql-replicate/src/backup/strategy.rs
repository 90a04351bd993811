//! Backup capture and restore strategies.
//!
//! [`MysqldumpStrategy`] shells out to the `mysqldump`/`mysql` client tools
//! and is preferred when they are installed. [`NativeDumpStrategy`] produces
//! an equivalent dump through the library's own reader, for hosts without
//! the client tools. Both write gzip-compressed SQL artifacts that the other
//! can read back.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EnvironmentConfig;
use crate::core::value::SqlValue;
use crate::core::quote_ident;
use crate::error::{ReplicateError, Result};
use crate::plan::DependencyGraph;
use crate::source::{MysqlReader, ReadOptions};
use crate::target::{render_create_table, MysqlWriter};

/// Capture options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureOptions {
    /// Dump structure only, no row data.
    pub structure_only: bool,
}

/// A way of capturing and restoring database dumps.
#[async_trait]
pub trait BackupStrategy: Send + Sync {
    /// Strategy name, recorded in artifact metadata.
    fn name(&self) -> &'static str;

    /// Whether the strategy can run on this host.
    async fn is_available(&self) -> bool;

    /// Capture a dump of `env` into the gzip file at `dest`.
    ///
    /// On failure or cancellation no partial file is left behind.
    async fn capture(
        &self,
        env: &EnvironmentConfig,
        opts: CaptureOptions,
        dest: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()>;

    /// Replay the dump at `artifact` against `env`.
    async fn restore(
        &self,
        env: &EnvironmentConfig,
        artifact: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()>;
}

/// Strategy backed by the `mysqldump` and `mysql` client tools.
#[derive(Debug, Default)]
pub struct MysqldumpStrategy;

impl MysqldumpStrategy {
    async fn tool_available(tool: &str) -> bool {
        Command::new(tool)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// Arguments passed to mysqldump. `--single-transaction` gives a consistent
/// InnoDB snapshot without locking; `--quick` streams rows instead of
/// buffering whole tables.
fn mysqldump_args(env: &EnvironmentConfig, structure_only: bool) -> Vec<String> {
    let mut args = vec![
        format!("--host={}", env.host),
        format!("--port={}", env.port),
        format!("--user={}", env.user),
        "--single-transaction".to_string(),
        "--routines".to_string(),
        "--triggers".to_string(),
        "--events".to_string(),
        "--add-drop-table".to_string(),
        "--create-options".to_string(),
        "--disable-keys".to_string(),
        "--extended-insert".to_string(),
        "--quick".to_string(),
        "--lock-tables=false".to_string(),
    ];
    if structure_only {
        args.push("--no-data".to_string());
    }
    args.push(env.database.clone());
    args
}

fn mysql_client_args(env: &EnvironmentConfig) -> Vec<String> {
    vec![
        format!("--host={}", env.host),
        format!("--port={}", env.port),
        format!("--user={}", env.user),
        env.database.clone(),
    ]
}

#[async_trait]
impl BackupStrategy for MysqldumpStrategy {
    fn name(&self) -> &'static str {
        "mysqldump"
    }

    async fn is_available(&self) -> bool {
        Self::tool_available("mysqldump").await
    }

    async fn capture(
        &self,
        env: &EnvironmentConfig,
        opts: CaptureOptions,
        dest: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut child = Command::new("mysqldump")
            .args(mysqldump_args(env, opts.structure_only))
            // Password via environment so it never shows in the process list.
            .env("MYSQL_PWD", &env.password)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ReplicateError::Backup(format!("spawning mysqldump: {}", e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReplicateError::Backup("mysqldump stdout unavailable".into()))?;

        let file = std::fs::File::create(dest)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        let mut buf = vec![0u8; 64 * 1024];

        let copy_result: Result<()> = async {
            loop {
                if *cancel.borrow() {
                    return Err(ReplicateError::Cancelled);
                }
                let n = stdout
                    .read(&mut buf)
                    .await
                    .map_err(|e| ReplicateError::Backup(format!("reading mysqldump output: {}", e)))?;
                if n == 0 {
                    break;
                }
                encoder.write_all(&buf[..n])?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = copy_result {
            let _ = child.kill().await;
            let _ = child.wait().await;
            let _ = tokio::fs::remove_file(dest).await;
            return Err(e);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ReplicateError::Backup(format!("waiting for mysqldump: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(ReplicateError::Backup(format!(
                "mysqldump exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        encoder.finish()?;
        debug!(dest = %dest.display(), "mysqldump capture complete");
        Ok(())
    }

    async fn restore(
        &self,
        env: &EnvironmentConfig,
        artifact: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut child = Command::new("mysql")
            .args(mysql_client_args(env))
            .env("MYSQL_PWD", &env.password)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ReplicateError::Restore(format!("spawning mysql client: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ReplicateError::Restore("mysql stdin unavailable".into()))?;

        let file = std::fs::File::open(artifact)?;
        let mut decoder = GzDecoder::new(file);
        let mut buf = vec![0u8; 64 * 1024];

        let feed_result: Result<()> = async {
            loop {
                if *cancel.borrow() {
                    return Err(ReplicateError::Cancelled);
                }
                let n = decoder.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                stdin
                    .write_all(&buf[..n])
                    .await
                    .map_err(|e| ReplicateError::Restore(format!("feeding mysql client: {}", e)))?;
            }
            Ok(())
        }
        .await;

        drop(stdin);

        if let Err(e) = feed_result {
            let _ = child.kill().await;
            let _ = child.wait().await;
            return Err(e);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ReplicateError::Restore(format!("waiting for mysql client: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReplicateError::Restore(format!(
                "mysql exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        info!(artifact = %artifact.display(), "mysqldump restore complete");
        Ok(())
    }
}

/// Library-native dump strategy: no external tools.
///
/// Tables are dumped in dependency order with foreign-key checks disabled
/// around the whole script, so restores replay sequentially without
/// ordering failures.
#[derive(Debug, Clone)]
pub struct NativeDumpStrategy {
    /// Connections opened against the dumped environment.
    pub max_connections: usize,

    /// Rows per extended INSERT statement.
    pub rows_per_insert: usize,
}

impl Default for NativeDumpStrategy {
    fn default() -> Self {
        Self {
            max_connections: 2,
            rows_per_insert: 500,
        }
    }
}

#[async_trait]
impl BackupStrategy for NativeDumpStrategy {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn capture(
        &self,
        env: &EnvironmentConfig,
        opts: CaptureOptions,
        dest: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let result = self.capture_inner(env, opts, dest, cancel).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    async fn restore(
        &self,
        env: &EnvironmentConfig,
        artifact: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let file = std::fs::File::open(artifact)?;
        let mut decoder = GzDecoder::new(file);
        let mut script = String::new();
        decoder.read_to_string(&mut script)?;

        let statements = split_statements(&script);
        // Single connection: the script's session settings (FOREIGN_KEY_CHECKS)
        // must apply to every statement.
        let writer = MysqlWriter::connect(env, 1).await?;

        for statement in &statements {
            if *cancel.borrow() {
                writer.close().await;
                return Err(ReplicateError::Cancelled);
            }
            writer
                .execute_statement(statement)
                .await
                .map_err(|e| ReplicateError::Restore(format!("replaying dump: {}", e)))?;
        }
        writer.close().await;

        info!(
            artifact = %artifact.display(),
            statements = statements.len(),
            "native restore complete"
        );
        Ok(())
    }
}

impl NativeDumpStrategy {
    async fn capture_inner(
        &self,
        env: &EnvironmentConfig,
        opts: CaptureOptions,
        dest: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let reader = MysqlReader::connect(env, self.max_connections).await?;

        let names = reader.list_tables().await?;
        let mut descriptors = Vec::with_capacity(names.len());
        for name in &names {
            descriptors.push(reader.describe_table(name).await?);
        }
        let order = DependencyGraph::build(descriptors.iter()).resolve();

        let file = std::fs::File::create(dest)?;
        let mut out = GzEncoder::new(file, Compression::default());

        writeln!(out, "-- native dump of {} ({})", env.database, env.host)?;
        writeln!(out, "SET FOREIGN_KEY_CHECKS=0;")?;

        for table_name in &order.creation_order {
            if *cancel.borrow() {
                reader.close().await;
                return Err(ReplicateError::Cancelled);
            }
            let descriptor = descriptors
                .iter()
                .find(|d| d.name == *table_name)
                .ok_or_else(|| ReplicateError::table_not_found(table_name))?;

            writeln!(out, "DROP TABLE IF EXISTS {};", quote_ident(table_name))?;
            writeln!(out, "{};", render_create_table(descriptor, &BTreeSet::new()))?;

            if opts.structure_only {
                continue;
            }

            let read_opts = ReadOptions::for_table(descriptor, self.rows_per_insert);
            let columns = read_opts.columns.clone();
            let mut rx = reader.read_table(read_opts, 4);

            while let Some(batch) = rx.recv().await {
                if *cancel.borrow() {
                    reader.close().await;
                    return Err(ReplicateError::Cancelled);
                }
                let batch = batch?;
                if batch.is_empty() {
                    break;
                }
                writeln!(out, "{}", render_insert(table_name, &columns, &batch.rows))?;
                if batch.is_last {
                    break;
                }
            }
        }

        writeln!(out, "SET FOREIGN_KEY_CHECKS=1;")?;
        out.finish()?;
        reader.close().await;

        debug!(dest = %dest.display(), tables = order.creation_order.len(), "native capture complete");
        Ok(())
    }
}

/// Render one extended INSERT statement with literal values.
fn render_insert(table: &str, columns: &[String], rows: &[Vec<SqlValue>]) -> String {
    let col_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let tuples = rows
        .iter()
        .map(|row| {
            let values = row.iter().map(sql_literal).collect::<Vec<_>>().join(",");
            format!("({})", values)
        })
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "INSERT INTO {} ({}) VALUES {};",
        quote_ident(table),
        col_list,
        tuples
    )
}

/// Render a typed value as a SQL literal, exactly as read.
fn sql_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null(_) => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        SqlValue::I16(v) => v.to_string(),
        SqlValue::I32(v) => v.to_string(),
        SqlValue::I64(v) => v.to_string(),
        SqlValue::U64(v) => v.to_string(),
        SqlValue::F32(v) => v.to_string(),
        SqlValue::F64(v) => v.to_string(),
        SqlValue::Decimal(d) => d.to_string(),
        SqlValue::Text(s) => quote_string(s),
        SqlValue::Bytes(b) => {
            if b.is_empty() {
                "''".to_string()
            } else {
                let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
                format!("0x{}", hex)
            }
        }
        SqlValue::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.f")),
        SqlValue::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        SqlValue::Time(t) => format!("'{}'", t.format("%H:%M:%S%.f")),
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Split a dump script into executable statements.
///
/// Tracks single-quote and backtick state (with `''` doubling and backslash
/// escapes) so semicolons inside literals do not split; `--` line comments
/// are dropped.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = script.chars().peekable();
    let mut in_string = false;
    let mut in_backtick = false;

    while let Some(c) = chars.next() {
        if in_string {
            current.push(c);
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                '\'' => {
                    if chars.peek() == Some(&'\'') {
                        current.push(chars.next().unwrap_or('\''));
                    } else {
                        in_string = false;
                    }
                }
                _ => {}
            }
            continue;
        }
        if in_backtick {
            current.push(c);
            if c == '`' {
                in_backtick = false;
            }
            continue;
        }

        match c {
            '\'' => {
                in_string = true;
                current.push(c);
            }
            '`' => {
                in_backtick = true;
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') && current.trim().is_empty() => {
                // Line comment at statement start: drop to end of line.
                for rest in chars.by_ref() {
                    if rest == '\n' {
                        break;
                    }
                }
                current.clear();
            }
            ';' => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}

/// Pick the first available strategy from an ordered preference list.
pub async fn pick_strategy(
    strategies: &[std::sync::Arc<dyn BackupStrategy>],
) -> Result<std::sync::Arc<dyn BackupStrategy>> {
    for strategy in strategies {
        if strategy.is_available().await {
            return Ok(std::sync::Arc::clone(strategy));
        }
        warn!(strategy = strategy.name(), "backup strategy unavailable");
    }
    Err(ReplicateError::Backup(
        "no backup strategy available on this host".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::SqlNullType;
    use chrono::NaiveDate;

    fn env() -> EnvironmentConfig {
        EnvironmentConfig {
            host: "db.internal".to_string(),
            port: 3307,
            database: "app".to_string(),
            user: "replicator".to_string(),
            password: "secret".to_string(),
            charset: "utf8mb4".to_string(),
        }
    }

    #[test]
    fn test_mysqldump_args() {
        let args = mysqldump_args(&env(), false);
        assert!(args.contains(&"--host=db.internal".to_string()));
        assert!(args.contains(&"--port=3307".to_string()));
        assert!(args.contains(&"--single-transaction".to_string()));
        assert!(args.contains(&"--lock-tables=false".to_string()));
        assert!(!args.contains(&"--no-data".to_string()));
        assert_eq!(args.last(), Some(&"app".to_string()));
        // Password never appears in the argument list.
        assert!(!args.iter().any(|a| a.contains("secret")));

        let structure = mysqldump_args(&env(), true);
        assert!(structure.contains(&"--no-data".to_string()));
    }

    #[test]
    fn test_sql_literal_rendering() {
        assert_eq!(sql_literal(&SqlValue::Null(SqlNullType::I32)), "NULL");
        assert_eq!(sql_literal(&SqlValue::I64(0)), "0");
        assert_eq!(sql_literal(&SqlValue::I64(-42)), "-42");
        assert_eq!(sql_literal(&SqlValue::Bool(true)), "1");
        assert_eq!(sql_literal(&SqlValue::Text("it's".into())), "'it''s'");
        assert_eq!(sql_literal(&SqlValue::Text("a\\b".into())), "'a\\\\b'");
        assert_eq!(sql_literal(&SqlValue::Bytes(vec![0xde, 0xad])), "0xdead");
        assert_eq!(sql_literal(&SqlValue::Bytes(vec![])), "''");
        assert_eq!(
            sql_literal(&SqlValue::Date(
                NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
            )),
            "'2026-08-01'"
        );
    }

    #[test]
    fn test_render_insert() {
        let rows = vec![
            vec![SqlValue::I32(1), SqlValue::Text("a".into())],
            vec![SqlValue::I32(2), SqlValue::Null(SqlNullType::String)],
        ];
        let sql = render_insert("t", &["id".to_string(), "name".to_string()], &rows);
        assert_eq!(
            sql,
            "INSERT INTO `t` (`id`, `name`) VALUES (1,'a'),(2,NULL);"
        );
    }

    #[test]
    fn test_split_statements_respects_literals() {
        let script = "INSERT INTO `t` VALUES ('a;b');\nDROP TABLE `x;y`;\n-- comment; not a stmt\nSELECT 1";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0], "INSERT INTO `t` VALUES ('a;b')");
        assert_eq!(stmts[1], "DROP TABLE `x;y`");
        assert_eq!(stmts[2], "SELECT 1");
    }

    #[test]
    fn test_split_statements_escaped_quote() {
        let stmts = split_statements("INSERT INTO t VALUES ('it''s; fine');");
        assert_eq!(stmts, vec!["INSERT INTO t VALUES ('it''s; fine')"]);

        let stmts = split_statements("INSERT INTO t VALUES ('a\\'b;c');");
        assert_eq!(stmts, vec!["INSERT INTO t VALUES ('a\\'b;c')"]);
    }
}
