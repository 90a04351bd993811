//! MySQL target writer: structure recreation and batched data writes.
//!
//! Uses mysql_async for connection pooling and multi-row INSERT. DDL is
//! rendered from source descriptors so the recreated table keeps the exact
//! declared column types, nullability, defaults, and key layout.
//!
//! DDL rendering is split into pure functions so statement shape is testable
//! without a live server.

use std::collections::BTreeSet;
use std::time::Duration;

use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, SslOpts};
use tracing::{debug, info, warn};

use crate::config::EnvironmentConfig;
use crate::core::quote_ident;
use crate::core::schema::{ColumnDescriptor, ForeignKeyDescriptor, TableDescriptor};
use crate::core::value::{to_mysql_value, Batch};
use crate::error::{ReplicateError, Result};

/// MySQL hard limit on statement placeholders.
const MYSQL_MAX_PLACEHOLDERS: usize = 65_535;

/// Connection attempts before giving up.
const CONNECT_ATTEMPTS: u32 = 3;

/// Delay before the first reconnect attempt; doubles each retry.
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Statements run on every new pooled connection.
///
/// Foreign-key checks stay off for the session: full-sync tables may
/// reference structure-only parents that are intentionally left empty, and
/// cycle-broken constraints attach to data that loaded without them.
fn session_init_statements(charset: &str) -> Vec<String> {
    vec![
        format!("SET NAMES {}", charset),
        "SET FOREIGN_KEY_CHECKS=0".to_string(),
    ]
}

/// A foreign key on the target that references a given table, found by
/// catalog lookup before a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencingConstraint {
    /// Table declaring the constraint.
    pub table: String,

    /// Constraint name.
    pub constraint: String,
}

/// MySQL target writer.
pub struct MysqlWriter {
    pool: Pool,
    database: String,
}

impl MysqlWriter {
    /// Connect to a target environment and verify the connection.
    pub async fn connect(env: &EnvironmentConfig, max_connections: usize) -> Result<Self> {
        let builder = OptsBuilder::default()
            .ip_or_hostname(&env.host)
            .tcp_port(env.port)
            .db_name(Some(&env.database))
            .user(Some(&env.user))
            .pass(Some(&env.password))
            .init(session_init_statements(&env.charset))
            .ssl_opts(Some(SslOpts::default().with_danger_accept_invalid_certs(true)));

        let pool_opts = PoolOpts::new().with_constraints(
            PoolConstraints::new(1, max_connections)
                .ok_or_else(|| ReplicateError::Config("max_connections must be at least 1".into()))?,
        );

        let opts: Opts = builder.pool_opts(pool_opts).into();

        let mut delay = CONNECT_BACKOFF;
        let mut attempt = 1;
        let pool = loop {
            match Self::try_connect(opts.clone()).await {
                Ok(pool) => break pool,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(attempt, error = %e, "target connection failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            "Connected to target: {}:{}/{}",
            env.host, env.port, env.database
        );

        Ok(Self {
            pool,
            database: env.database.clone(),
        })
    }

    async fn try_connect(opts: Opts) -> Result<Pool> {
        let pool = Pool::new(opts);
        let check = async {
            let mut conn = pool
                .get_conn()
                .await
                .map_err(|e| ReplicateError::connectivity(e, "creating target pool"))?;
            conn.query_drop("SELECT 1")
                .await
                .map_err(|e| ReplicateError::connectivity(e, "testing target connection"))
        }
        .await;

        match check {
            Ok(()) => Ok(pool),
            Err(e) => {
                let _ = pool.disconnect().await;
                Err(e)
            }
        }
    }

    /// Test the connection.
    pub async fn test_connection(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop("SELECT 1").await?;
        Ok(())
    }

    /// Whether a table exists on the target.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut conn = self.pool.get_conn().await?;
        let sql = r#"
            SELECT COUNT(*) AS cnt FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        "#;
        let count: Option<i64> = conn.exec_first(sql, (&self.database, table)).await?;
        Ok(count.unwrap_or(0) > 0)
    }

    /// List base tables on the target, sorted by name.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let sql = r#"
            SELECT CAST(TABLE_NAME AS CHAR(255))
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;
        let tables: Vec<String> = conn.exec(sql, (&self.database,)).await?;
        Ok(tables)
    }


    /// Find foreign keys on other target tables that reference the given
    /// table. These block a DROP TABLE and must be detached first.
    pub async fn list_referencing_constraints(
        &self,
        table: &str,
    ) -> Result<Vec<ReferencingConstraint>> {
        let mut conn = self.pool.get_conn().await?;
        let sql = r#"
            SELECT
                CAST(TABLE_NAME AS CHAR(255)),
                CAST(CONSTRAINT_NAME AS CHAR(255))
            FROM information_schema.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ?
              AND REFERENCED_TABLE_NAME = ?
              AND TABLE_NAME != ?
            GROUP BY TABLE_NAME, CONSTRAINT_NAME
            ORDER BY TABLE_NAME, CONSTRAINT_NAME
        "#;
        let rows: Vec<(String, String)> =
            conn.exec(sql, (&self.database, table, table)).await?;
        Ok(rows
            .into_iter()
            .map(|(table, constraint)| ReferencingConstraint { table, constraint })
            .collect())
    }

    /// Drop a foreign key constraint.
    pub async fn drop_foreign_key(&self, table: &str, constraint: &str) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        let sql = format!(
            "ALTER TABLE {} DROP FOREIGN KEY {}",
            quote_ident(table),
            quote_ident(constraint)
        );
        conn.query_drop(&sql)
            .await
            .map_err(|e| ReplicateError::structural(table, format!("dropping FK {}: {}", constraint, e)))?;
        debug!(table, constraint, "dropped foreign key");
        Ok(())
    }

    /// Attach a foreign key constraint to an existing table.
    pub async fn add_foreign_key(&self, table: &str, fk: &ForeignKeyDescriptor) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        let sql = render_add_foreign_key(table, fk);
        conn.query_drop(&sql)
            .await
            .map_err(|e| ReplicateError::structural(table, format!("adding FK {}: {}", fk.name, e)))?;
        debug!(table, constraint = %fk.name, "added foreign key");
        Ok(())
    }

    /// Drop a table if it exists.
    pub async fn drop_table(&self, table: &str) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
        conn.query_drop(&sql)
            .await
            .map_err(|e| ReplicateError::structural(table, format!("DROP TABLE: {}", e)))?;
        debug!(table, "dropped table");
        Ok(())
    }

    /// Create a table from a descriptor, omitting the named constraints.
    pub async fn create_table(
        &self,
        descriptor: &TableDescriptor,
        skip_constraints: &BTreeSet<String>,
    ) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        let ddl = render_create_table(descriptor, skip_constraints);
        conn.query_drop(&ddl)
            .await
            .map_err(|e| ReplicateError::structural(&descriptor.name, format!("CREATE TABLE: {}", e)))?;
        debug!(table = %descriptor.name, "created table");
        Ok(())
    }

    /// Delete all rows from a table. DELETE rather than TRUNCATE so the
    /// statement succeeds under referencing constraints that were already
    /// detached row-wise, and so it participates in binary logging normally.
    pub async fn delete_all_rows(&self, table: &str) -> Result<u64> {
        let mut conn = self.pool.get_conn().await?;
        let sql = format!("DELETE FROM {}", quote_ident(table));
        conn.query_drop(&sql)
            .await
            .map_err(|e| ReplicateError::transfer(table, format!("DELETE: {}", e)))?;
        Ok(conn.affected_rows())
    }

    /// Remove the AUTO_INCREMENT attribute from a column, keeping the rest
    /// of its declaration intact. Required before inserting literal zeros
    /// into an identity column.
    pub async fn drop_auto_increment(
        &self,
        table: &str,
        column: &ColumnDescriptor,
    ) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        let sql = render_modify_column(table, column, false);
        conn.query_drop(&sql)
            .await
            .map_err(|e| ReplicateError::structural(table, format!("dropping AUTO_INCREMENT: {}", e)))?;
        warn!(table, column = %column.name, "AUTO_INCREMENT removed to preserve zero-valued keys");
        Ok(())
    }

    /// Write one batch using multi-row INSERT, chunked under the placeholder
    /// limit.
    pub async fn write_batch(&self, table: &str, cols: &[String], batch: Batch) -> Result<u64> {
        let rows = batch.rows;
        if rows.is_empty() {
            return Ok(0);
        }

        let row_count = rows.len() as u64;
        let quoted_table = quote_ident(table);
        let col_list = cols
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let num_cols = cols.len();
        if num_cols == 0 {
            return Ok(0);
        }
        let max_rows_per_stmt = (MYSQL_MAX_PLACEHOLDERS / num_cols).max(1);

        let mut conn = self.pool.get_conn().await?;

        for chunk in rows.chunks(max_rows_per_stmt) {
            let placeholders_per_row = format!("({})", vec!["?"; num_cols].join(", "));
            let all_placeholders = vec![placeholders_per_row; chunk.len()].join(", ");

            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                quoted_table, col_list, all_placeholders
            );

            let params: Vec<mysql_async::Value> = chunk
                .iter()
                .flat_map(|row| row.iter().map(to_mysql_value))
                .collect();

            conn.exec_drop(&sql, params)
                .await
                .map_err(|e| ReplicateError::transfer(table, format!("INSERT batch: {}", e)))?;
        }

        debug!(table, rows = row_count, "wrote batch");
        Ok(row_count)
    }

    /// Execute one raw statement. Used by dump restore replay.
    pub async fn execute_statement(&self, sql: &str) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(sql).await?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.clone().disconnect().await.ok();
    }
}

/// Render one column definition.
fn render_column(col: &ColumnDescriptor, with_auto_increment: bool) -> String {
    let mut def = format!("{} {}", quote_ident(&col.name), col.column_type);

    if !col.is_nullable {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        def.push_str(&format!(" DEFAULT {}", render_default(default)));
    }
    if col.is_auto_increment && with_auto_increment {
        def.push_str(" AUTO_INCREMENT");
    }

    def
}

/// Render a catalog default value as a DDL literal. Function-call defaults
/// and NULL stay bare; everything else is quoted.
fn render_default(default: &str) -> String {
    let upper = default.to_uppercase();
    if upper == "NULL" || upper.starts_with("CURRENT_TIMESTAMP") || default.contains('(') {
        default.to_string()
    } else {
        format!("'{}'", default.replace('\'', "''"))
    }
}

/// Render the full CREATE TABLE statement for a descriptor.
///
/// Columns, primary key, secondary indexes, and foreign keys (minus
/// `skip_constraints`) are declared inline; creation order guarantees every
/// referenced table already exists.
pub fn render_create_table(
    descriptor: &TableDescriptor,
    skip_constraints: &BTreeSet<String>,
) -> String {
    let mut parts: Vec<String> = descriptor
        .columns
        .iter()
        .map(|c| render_column(c, true))
        .collect();

    if !descriptor.primary_key.is_empty() {
        let pk_cols = descriptor
            .primary_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("PRIMARY KEY ({})", pk_cols));
    }

    for idx in &descriptor.indexes {
        let cols = idx
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let unique = if idx.is_unique { "UNIQUE " } else { "" };
        parts.push(format!("{}KEY {} ({})", unique, quote_ident(&idx.name), cols));
    }

    for fk in &descriptor.foreign_keys {
        if skip_constraints.contains(&fk.name) {
            continue;
        }
        parts.push(render_foreign_key_clause(fk));
    }

    format!(
        "CREATE TABLE {} (\n    {}\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        quote_ident(&descriptor.name),
        parts.join(",\n    ")
    )
}

/// Render an inline FOREIGN KEY clause.
fn render_foreign_key_clause(fk: &ForeignKeyDescriptor) -> String {
    let cols = fk
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let ref_cols = fk
        .ref_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
        quote_ident(&fk.name),
        cols,
        quote_ident(&fk.ref_table),
        ref_cols,
        fk.on_delete,
        fk.on_update
    )
}

/// Render an ALTER TABLE ... ADD CONSTRAINT statement.
pub fn render_add_foreign_key(table: &str, fk: &ForeignKeyDescriptor) -> String {
    format!(
        "ALTER TABLE {} ADD {}",
        quote_ident(table),
        render_foreign_key_clause(fk)
    )
}

/// Render ALTER TABLE ... MODIFY COLUMN, with or without AUTO_INCREMENT.
pub fn render_modify_column(
    table: &str,
    column: &ColumnDescriptor,
    with_auto_increment: bool,
) -> String {
    format!(
        "ALTER TABLE {} MODIFY COLUMN {}",
        quote_ident(table),
        render_column(column, with_auto_increment)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::IndexDescriptor;

    #[test]
    fn test_session_init_disables_fk_checks() {
        let init = session_init_statements("utf8mb4");
        assert_eq!(init[0], "SET NAMES utf8mb4");
        assert!(init.contains(&"SET FOREIGN_KEY_CHECKS=0".to_string()));
    }

    fn column(name: &str, column_type: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            column_type: column_type.to_string(),
            is_nullable: true,
            default: None,
            is_auto_increment: false,
            ordinal_pos: 1,
        }
    }

    fn fk(name: &str, col: &str, ref_table: &str) -> ForeignKeyDescriptor {
        ForeignKeyDescriptor {
            name: name.to_string(),
            columns: vec![col.to_string()],
            ref_table: ref_table.to_string(),
            ref_columns: vec!["id".to_string()],
            on_delete: "CASCADE".to_string(),
            on_update: "RESTRICT".to_string(),
        }
    }

    #[test]
    fn test_render_column_auto_increment() {
        let mut col = column("id", "bigint unsigned");
        col.is_nullable = false;
        col.is_auto_increment = true;

        assert_eq!(
            render_column(&col, true),
            "`id` bigint unsigned NOT NULL AUTO_INCREMENT"
        );
        assert_eq!(render_column(&col, false), "`id` bigint unsigned NOT NULL");
    }

    #[test]
    fn test_render_default_quoting() {
        assert_eq!(render_default("active"), "'active'");
        assert_eq!(render_default("it's"), "'it''s'");
        assert_eq!(render_default("CURRENT_TIMESTAMP"), "CURRENT_TIMESTAMP");
        assert_eq!(
            render_default("current_timestamp(6)"),
            "current_timestamp(6)"
        );
        assert_eq!(render_default("NULL"), "NULL");
    }

    #[test]
    fn test_render_create_table_full() {
        let mut id = column("id", "int");
        id.is_nullable = false;
        id.is_auto_increment = true;

        let descriptor = TableDescriptor {
            name: "orders".to_string(),
            columns: vec![id, column("customer_id", "int"), column("note", "varchar(100)")],
            primary_key: vec!["id".to_string()],
            indexes: vec![IndexDescriptor {
                name: "idx_customer".to_string(),
                columns: vec!["customer_id".to_string()],
                is_unique: false,
            }],
            foreign_keys: vec![fk("fk_orders_customer", "customer_id", "customers")],
            row_count: 0,
        };

        let ddl = render_create_table(&descriptor, &BTreeSet::new());
        assert!(ddl.starts_with("CREATE TABLE `orders`"));
        assert!(ddl.contains("`id` int NOT NULL AUTO_INCREMENT"));
        assert!(ddl.contains("PRIMARY KEY (`id`)"));
        assert!(ddl.contains("KEY `idx_customer` (`customer_id`)"));
        assert!(ddl.contains(
            "CONSTRAINT `fk_orders_customer` FOREIGN KEY (`customer_id`) REFERENCES `customers` (`id`) ON DELETE CASCADE ON UPDATE RESTRICT"
        ));
        assert!(ddl.ends_with("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"));
    }

    #[test]
    fn test_render_create_table_skips_broken_constraints() {
        let descriptor = TableDescriptor {
            name: "a".to_string(),
            columns: vec![column("id", "int"), column("b_id", "int")],
            primary_key: vec![],
            indexes: vec![],
            foreign_keys: vec![fk("fk_a_b", "b_id", "b")],
            row_count: 0,
        };

        let skip: BTreeSet<String> = ["fk_a_b".to_string()].into_iter().collect();
        let ddl = render_create_table(&descriptor, &skip);
        assert!(!ddl.contains("fk_a_b"));
        assert!(!ddl.contains("FOREIGN KEY"));
    }

    #[test]
    fn test_render_add_foreign_key() {
        let sql = render_add_foreign_key("a", &fk("fk_a_b", "b_id", "b"));
        assert_eq!(
            sql,
            "ALTER TABLE `a` ADD CONSTRAINT `fk_a_b` FOREIGN KEY (`b_id`) REFERENCES `b` (`id`) ON DELETE CASCADE ON UPDATE RESTRICT"
        );
    }

    #[test]
    fn test_render_modify_column_strips_auto_increment() {
        let mut col = column("id", "int");
        col.is_nullable = false;
        col.is_auto_increment = true;

        assert_eq!(
            render_modify_column("users", &col, false),
            "ALTER TABLE `users` MODIFY COLUMN `id` int NOT NULL"
        );
        assert_eq!(
            render_modify_column("users", &col, true),
            "ALTER TABLE `users` MODIFY COLUMN `id` int NOT NULL AUTO_INCREMENT"
        );
    }
}
