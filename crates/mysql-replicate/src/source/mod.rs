//! MySQL source reader: schema inspection and batched row reads.
//!
//! Uses SQLx for connection pooling and async query execution. Inspection
//! queries go through `INFORMATION_SCHEMA`; identifier-typed columns are CAST
//! to CHAR because some server collations report them as VARBINARY.

use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Row, ValueRef};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EnvironmentConfig;
use crate::core::schema::{
    ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, TableDescriptor,
};
use crate::core::value::{Batch, SqlNullType, SqlValue};
use crate::core::quote_ident;
use crate::error::{ReplicateError, Result};

/// Connection pool acquire timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection attempts before giving up.
const CONNECT_ATTEMPTS: u32 = 3;

/// Delay before the first reconnect attempt; doubles each retry.
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Options for one table read stream.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Table to read.
    pub table: String,

    /// Column names, in ordinal order.
    pub columns: Vec<String>,

    /// Declared type strings matching `columns`.
    pub col_types: Vec<String>,

    /// Index into `columns` of a single-column integer primary key, when the
    /// table supports keyset pagination.
    pub pk_idx: Option<usize>,

    /// Rows per batch.
    pub batch_size: usize,
}

impl ReadOptions {
    /// Derive read options from a table descriptor.
    pub fn for_table(descriptor: &TableDescriptor, batch_size: usize) -> Self {
        let columns = descriptor.column_names();
        let pk_idx = if descriptor.supports_keyset_pagination() {
            columns.iter().position(|c| *c == descriptor.primary_key[0])
        } else {
            None
        };
        Self {
            table: descriptor.name.clone(),
            col_types: descriptor.column_types(),
            columns,
            pk_idx,
            batch_size,
        }
    }
}

/// MySQL source reader.
pub struct MysqlReader {
    pool: MySqlPool,
    database: String,
}

impl MysqlReader {
    /// Connect to a source environment and verify the connection.
    ///
    /// Connectivity failures are retried with doubling backoff before the
    /// error is surfaced.
    pub async fn connect(env: &EnvironmentConfig, max_connections: usize) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&env.host)
            .port(env.port)
            .database(&env.database)
            .username(&env.user)
            .password(&env.password)
            .charset(&env.charset)
            .ssl_mode(MySqlSslMode::Preferred);

        let mut delay = CONNECT_BACKOFF;
        let mut attempt = 1;
        let pool = loop {
            match Self::try_connect(options.clone(), max_connections).await {
                Ok(pool) => break pool,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(attempt, error = %e, "source connection failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            "Connected to source: {}:{}/{}",
            env.host, env.port, env.database
        );

        Ok(Self {
            pool,
            database: env.database.clone(),
        })
    }

    async fn try_connect(options: MySqlConnectOptions, max_connections: usize) -> Result<MySqlPool> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| ReplicateError::connectivity(e, "creating source pool"))?;

        if let Err(e) = sqlx::query("SELECT 1").fetch_one(&pool).await {
            pool.close().await;
            return Err(ReplicateError::connectivity(e, "testing source connection"));
        }
        Ok(pool)
    }

    /// Test the connection.
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ReplicateError::connectivity(e, "testing source connection"))?;
        Ok(())
    }

    /// List base tables in the source database, sorted by name. Views are
    /// excluded.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("TABLE_NAME"))
            .collect())
    }

    /// Describe one table: columns, primary key, indexes, foreign keys, and
    /// an exact row count.
    pub async fn describe_table(&self, table: &str) -> Result<TableDescriptor> {
        let columns = self.load_columns(table).await?;
        if columns.is_empty() {
            return Err(ReplicateError::table_not_found(table));
        }

        let primary_key = self.load_primary_key(table).await?;
        let indexes = self.load_indexes(table).await?;
        let foreign_keys = self.load_foreign_keys(table).await?;
        let row_count = self.get_row_count(table).await?;

        debug!(
            table,
            columns = columns.len(),
            indexes = indexes.len(),
            foreign_keys = foreign_keys.len(),
            row_count,
            "described table"
        );

        Ok(TableDescriptor {
            name: table.to_string(),
            columns,
            primary_key,
            indexes,
            foreign_keys,
            row_count,
        })
    }

    async fn load_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        // COLUMN_TYPE keeps the full declared type (display width, unsigned,
        // enum values) so recreation preserves the exact declaration.
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(COLUMN_TYPE AS CHAR(1024)) AS COLUMN_TYPE,
                IF(IS_NULLABLE = 'YES', 1, 0) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR(1024)) AS COLUMN_DEFAULT,
                IF(EXTRA LIKE '%auto_increment%', 1, 0) AS is_auto_increment,
                CAST(ORDINAL_POSITION AS UNSIGNED) AS ORDINAL_POSITION
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| ColumnDescriptor {
                name: row.get::<String, _>("COLUMN_NAME"),
                column_type: row.get::<String, _>("COLUMN_TYPE"),
                is_nullable: row.get::<i32, _>("is_nullable") == 1,
                default: row.try_get::<Option<String>, _>("COLUMN_DEFAULT").unwrap_or(None),
                is_auto_increment: row.get::<i32, _>("is_auto_increment") == 1,
                ordinal_pos: row.get::<u64, _>("ORDINAL_POSITION") as u32,
            })
            .collect())
    }

    async fn load_primary_key(&self, table: &str) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("COLUMN_NAME"))
            .collect())
    }

    async fn load_indexes(&self, table: &str) -> Result<Vec<IndexDescriptor>> {
        let query = r#"
            SELECT
                CAST(INDEX_NAME AS CHAR(255)) AS INDEX_NAME,
                GROUP_CONCAT(CAST(COLUMN_NAME AS CHAR(255)) ORDER BY SEQ_IN_INDEX) AS columns,
                IF(NON_UNIQUE = 0, 1, 0) AS is_unique
            FROM INFORMATION_SCHEMA.STATISTICS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
              AND INDEX_NAME != 'PRIMARY'
            GROUP BY INDEX_NAME, NON_UNIQUE
            ORDER BY INDEX_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let columns_str: String = row.get("columns");
                IndexDescriptor {
                    name: row.get::<String, _>("INDEX_NAME"),
                    columns: columns_str.split(',').map(|s| s.to_string()).collect(),
                    is_unique: row.get::<i32, _>("is_unique") == 1,
                }
            })
            .collect())
    }

    async fn load_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        let query = r#"
            SELECT
                CAST(rc.CONSTRAINT_NAME AS CHAR(255)) AS CONSTRAINT_NAME,
                CAST(kcu.COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(kcu.REFERENCED_TABLE_NAME AS CHAR(255)) AS REFERENCED_TABLE_NAME,
                CAST(kcu.REFERENCED_COLUMN_NAME AS CHAR(255)) AS REFERENCED_COLUMN_NAME,
                CAST(rc.DELETE_RULE AS CHAR(255)) AS DELETE_RULE,
                CAST(rc.UPDATE_RULE AS CHAR(255)) AS UPDATE_RULE
            FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                ON rc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA
                AND rc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                AND rc.TABLE_NAME = kcu.TABLE_NAME
            WHERE rc.CONSTRAINT_SCHEMA = ? AND rc.TABLE_NAME = ?
            ORDER BY rc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        // Group multi-column constraints by name; BTreeMap keeps the result
        // ordered by constraint name.
        let mut fk_map: std::collections::BTreeMap<String, ForeignKeyDescriptor> =
            std::collections::BTreeMap::new();

        for row in rows {
            let name: String = row.get("CONSTRAINT_NAME");
            let column: String = row.get("COLUMN_NAME");
            let ref_table: String = row.get("REFERENCED_TABLE_NAME");
            let ref_column: String = row.get("REFERENCED_COLUMN_NAME");
            let on_delete: String = row.get("DELETE_RULE");
            let on_update: String = row.get("UPDATE_RULE");

            let fk = fk_map
                .entry(name.clone())
                .or_insert_with(|| ForeignKeyDescriptor {
                    name,
                    columns: Vec::new(),
                    ref_table,
                    ref_columns: Vec::new(),
                    on_delete,
                    on_update,
                });

            fk.columns.push(column);
            fk.ref_columns.push(ref_column);
        }

        Ok(fk_map.into_values().collect())
    }

    /// Exact row count for a table.
    pub async fn get_row_count(&self, table: &str) -> Result<i64> {
        let query = format!("SELECT COUNT(*) AS cnt FROM {}", quote_ident(table));

        let row: MySqlRow = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("cnt"))
    }

    /// Count rows where an auto-increment column holds the literal value 0.
    ///
    /// Such rows cannot be inserted verbatim while the target column carries
    /// AUTO_INCREMENT, so the caller needs to know before data transfer
    /// starts.
    pub async fn count_zero_identity_rows(&self, table: &str, column: &str) -> Result<i64> {
        let query = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE {} = 0",
            quote_ident(table),
            quote_ident(column)
        );

        let row: MySqlRow = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("cnt"))
    }

    /// Stream a table's rows in batches over a bounded channel.
    ///
    /// Keyset pagination on the integer primary key when available, OFFSET
    /// pagination otherwise. The channel capacity bounds read-ahead; the
    /// reader blocks when the writer falls behind.
    pub fn read_table(&self, opts: ReadOptions, read_ahead: usize) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(read_ahead.max(1));
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let result = Self::read_table_impl(pool, opts, tx.clone()).await;
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn read_table_impl(
        pool: MySqlPool,
        opts: ReadOptions,
        tx: mpsc::Sender<Result<Batch>>,
    ) -> Result<()> {
        let col_list = opts
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let table_ref = quote_ident(&opts.table);
        let pk_col: Option<&str> = opts
            .pk_idx
            .and_then(|idx| opts.columns.get(idx).map(|s| s.as_str()));

        let base_types: Vec<String> = opts.col_types.iter().map(|t| base_type(t)).collect();
        let unsigned: Vec<bool> = opts
            .col_types
            .iter()
            .map(|t| t.to_lowercase().contains("unsigned"))
            .collect();

        let mut last_pk: Option<i64> = None;
        let mut offset: usize = 0;
        let use_keyset = pk_col.is_some();

        loop {
            let mut query = format!("SELECT {} FROM {}", col_list, table_ref);

            if use_keyset {
                if let (Some(pk), Some(lpk)) = (pk_col, last_pk) {
                    query.push_str(&format!(" WHERE {} > {}", quote_ident(pk), lpk));
                }
                if let Some(pk) = pk_col {
                    query.push_str(&format!(" ORDER BY {}", quote_ident(pk)));
                }
                query.push_str(&format!(" LIMIT {}", opts.batch_size));
            } else {
                query.push_str(&format!(" LIMIT {} OFFSET {}", opts.batch_size, offset));
            }

            let rows: Vec<MySqlRow> = sqlx::query(&query).fetch_all(&pool).await?;

            if rows.is_empty() {
                // Deliver an explicit empty terminal batch so the consumer
                // always sees is_last.
                let _ = tx
                    .send(Ok(Batch {
                        rows: Vec::new(),
                        is_last: true,
                    }))
                    .await;
                break;
            }

            let batch_rows: Vec<Vec<SqlValue>> = rows
                .iter()
                .map(|row| decode_row(row, &base_types, &unsigned))
                .collect();

            if use_keyset {
                last_pk = opts.pk_idx.and_then(|idx| {
                    batch_rows.last().and_then(|row| match &row[idx] {
                        SqlValue::I64(v) => Some(*v),
                        SqlValue::I32(v) => Some(*v as i64),
                        SqlValue::I16(v) => Some(*v as i64),
                        SqlValue::U64(v) => Some(*v as i64),
                        _ => None,
                    })
                });
                if last_pk.is_none() {
                    return Err(ReplicateError::transfer(
                        &opts.table,
                        "primary key value not usable for keyset pagination",
                    ));
                }
            } else {
                offset += batch_rows.len();
            }

            let is_last = batch_rows.len() < opts.batch_size;
            let batch = Batch {
                rows: batch_rows,
                is_last,
            };

            if tx.send(Ok(batch)).await.is_err() {
                break; // Receiver dropped
            }

            if is_last {
                break;
            }
        }

        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Base type name from a full declared type string.
/// `"int(11) unsigned"` -> `"int"`, `"varchar(255)"` -> `"varchar"`.
fn base_type(column_type: &str) -> String {
    column_type
        .to_lowercase()
        .split(['(', ' '])
        .next()
        .unwrap_or("")
        .to_string()
}

/// Decode one row into typed values, indexed by position.
fn decode_row(row: &MySqlRow, base_types: &[String], unsigned: &[bool]) -> Vec<SqlValue> {
    base_types
        .iter()
        .enumerate()
        .map(|(i, data_type)| {
            let is_null: bool = row.try_get_raw(i).map(|r| r.is_null()).unwrap_or(true);
            if is_null {
                return SqlValue::Null(null_type_for(data_type));
            }
            let is_unsigned = unsigned.get(i).copied().unwrap_or(false);

            match data_type.as_str() {
                "tinyint" => {
                    if is_unsigned {
                        row.try_get::<u8, _>(i)
                            .map(|v| SqlValue::I16(v as i16))
                            .unwrap_or(SqlValue::Null(SqlNullType::I16))
                    } else {
                        row.try_get::<i8, _>(i)
                            .map(|v| SqlValue::I16(v as i16))
                            .unwrap_or(SqlValue::Null(SqlNullType::I16))
                    }
                }
                "smallint" => {
                    if is_unsigned {
                        row.try_get::<u16, _>(i)
                            .map(|v| SqlValue::I32(v as i32))
                            .unwrap_or(SqlValue::Null(SqlNullType::I32))
                    } else {
                        row.try_get::<i16, _>(i)
                            .map(SqlValue::I16)
                            .unwrap_or(SqlValue::Null(SqlNullType::I16))
                    }
                }
                "mediumint" | "int" | "integer" => {
                    if is_unsigned {
                        row.try_get::<u32, _>(i)
                            .map(|v| SqlValue::I64(v as i64))
                            .unwrap_or(SqlValue::Null(SqlNullType::I64))
                    } else {
                        row.try_get::<i32, _>(i)
                            .map(SqlValue::I32)
                            .unwrap_or(SqlValue::Null(SqlNullType::I32))
                    }
                }
                "bigint" => {
                    if is_unsigned {
                        row.try_get::<u64, _>(i)
                            .map(SqlValue::U64)
                            .unwrap_or(SqlValue::Null(SqlNullType::U64))
                    } else {
                        row.try_get::<i64, _>(i)
                            .map(SqlValue::I64)
                            .unwrap_or(SqlValue::Null(SqlNullType::I64))
                    }
                }
                "float" => row
                    .try_get::<f32, _>(i)
                    .map(SqlValue::F32)
                    .unwrap_or(SqlValue::Null(SqlNullType::F32)),
                "double" | "real" => row
                    .try_get::<f64, _>(i)
                    .map(SqlValue::F64)
                    .unwrap_or(SqlValue::Null(SqlNullType::F64)),
                "decimal" | "numeric" => row
                    .try_get::<rust_decimal::Decimal, _>(i)
                    .map(SqlValue::Decimal)
                    .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
                "bit" | "boolean" | "bool" => row
                    .try_get::<bool, _>(i)
                    .map(SqlValue::Bool)
                    .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
                "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum"
                | "set" | "json" => row
                    .try_get::<String, _>(i)
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null(SqlNullType::String)),
                "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => row
                    .try_get::<Vec<u8>, _>(i)
                    .map(SqlValue::Bytes)
                    .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
                "date" => row
                    .try_get::<chrono::NaiveDate, _>(i)
                    .map(SqlValue::Date)
                    .unwrap_or(SqlValue::Null(SqlNullType::Date)),
                "time" => row
                    .try_get::<chrono::NaiveTime, _>(i)
                    .map(SqlValue::Time)
                    .unwrap_or(SqlValue::Null(SqlNullType::Time)),
                "datetime" | "timestamp" => row
                    .try_get::<chrono::NaiveDateTime, _>(i)
                    .map(SqlValue::DateTime)
                    .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
                // Everything else falls back to text.
                _ => row
                    .try_get::<String, _>(i)
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null(SqlNullType::String)),
            }
        })
        .collect()
}

/// Null type hint for a base MySQL data type.
fn null_type_for(data_type: &str) -> SqlNullType {
    match data_type {
        "tinyint" | "smallint" => SqlNullType::I16,
        "mediumint" | "int" | "integer" => SqlNullType::I32,
        "bigint" => SqlNullType::I64,
        "float" => SqlNullType::F32,
        "double" | "real" => SqlNullType::F64,
        "decimal" | "numeric" => SqlNullType::Decimal,
        "bit" | "boolean" | "bool" => SqlNullType::Bool,
        "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
            SqlNullType::Bytes
        }
        "date" => SqlNullType::Date,
        "time" => SqlNullType::Time,
        "datetime" | "timestamp" => SqlNullType::DateTime,
        _ => SqlNullType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ColumnDescriptor;

    fn column(name: &str, column_type: &str, auto_inc: bool) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            column_type: column_type.to_string(),
            is_nullable: false,
            default: None,
            is_auto_increment: auto_inc,
            ordinal_pos: 1,
        }
    }

    #[test]
    fn test_base_type() {
        assert_eq!(base_type("int(11) unsigned"), "int");
        assert_eq!(base_type("varchar(255)"), "varchar");
        assert_eq!(base_type("DECIMAL(10,2)"), "decimal");
        assert_eq!(base_type("bigint unsigned"), "bigint");
        assert_eq!(base_type("enum('a','b')"), "enum");
    }

    #[test]
    fn test_null_type_for() {
        assert!(matches!(null_type_for("int"), SqlNullType::I32));
        assert!(matches!(null_type_for("bigint"), SqlNullType::I64));
        assert!(matches!(null_type_for("varchar"), SqlNullType::String));
        assert!(matches!(null_type_for("blob"), SqlNullType::Bytes));
        assert!(matches!(null_type_for("timestamp"), SqlNullType::DateTime));
    }

    #[test]
    fn test_read_options_keyset_on_integer_pk() {
        let descriptor = TableDescriptor {
            name: "users".to_string(),
            columns: vec![column("id", "bigint", true), column("name", "varchar(50)", false)],
            primary_key: vec!["id".to_string()],
            indexes: vec![],
            foreign_keys: vec![],
            row_count: 0,
        };
        let opts = ReadOptions::for_table(&descriptor, 500);
        assert_eq!(opts.pk_idx, Some(0));
        assert_eq!(opts.columns, vec!["id", "name"]);
        assert_eq!(opts.batch_size, 500);
    }

    #[test]
    fn test_read_options_offset_on_text_pk() {
        let descriptor = TableDescriptor {
            name: "codes".to_string(),
            columns: vec![column("code", "varchar(16)", false)],
            primary_key: vec!["code".to_string()],
            indexes: vec![],
            foreign_keys: vec![],
            row_count: 0,
        };
        let opts = ReadOptions::for_table(&descriptor, 500);
        assert_eq!(opts.pk_idx, None);
    }
}
