//! SQL value types for exact-value data transfer.
//!
//! Rows travel from the source reader to the target writer as typed values so
//! that literals survive the round trip unchanged — including the value 0 in
//! auto-increment columns, which a textual re-serialization through the
//! engine's default insert semantics would silently renumber.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;

/// Type hint for NULL values so the target binding keeps column affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    U64,
    F32,
    F64,
    String,
    Bytes,
    Decimal,
    DateTime,
    Date,
    Time,
}

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with a type hint.
    Null(SqlNullType),

    /// Boolean (bit/tinyint(1)).
    Bool(bool),

    /// 16-bit signed integer (smallint, tinyint widened).
    I16(i16),

    /// 32-bit signed integer (int, mediumint).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 64-bit unsigned integer (bigint unsigned).
    U64(u64),

    /// 32-bit float.
    F32(f32),

    /// 64-bit float.
    F64(f64),

    /// Text data (char/varchar/text/enum/set/json).
    Text(String),

    /// Binary data (binary/varbinary/blob).
    Bytes(Vec<u8>),

    /// Exact decimal (decimal/numeric).
    Decimal(Decimal),

    /// Date and time without zone (datetime/timestamp).
    DateTime(NaiveDateTime),

    /// Date only.
    Date(NaiveDate),

    /// Time only.
    Time(NaiveTime),
}

/// Convert a [`SqlValue`] to a mysql_async bind parameter.
///
/// Temporal values are packed into the wire-level `Value::Date`/`Value::Time`
/// representations directly; the driver exposes no chrono conversions with
/// the feature set in use here.
pub fn to_mysql_value(value: &SqlValue) -> mysql_async::Value {
    match value {
        SqlValue::Null(_) => mysql_async::Value::NULL,
        SqlValue::Bool(b) => mysql_async::Value::from(*b),
        SqlValue::I16(i) => mysql_async::Value::from(*i),
        SqlValue::I32(i) => mysql_async::Value::from(*i),
        SqlValue::I64(i) => mysql_async::Value::from(*i),
        SqlValue::U64(u) => mysql_async::Value::from(*u),
        SqlValue::F32(f) => mysql_async::Value::from(*f),
        SqlValue::F64(f) => mysql_async::Value::from(*f),
        SqlValue::Text(s) => mysql_async::Value::from(s.as_str()),
        SqlValue::Bytes(b) => mysql_async::Value::from(b.as_slice()),
        SqlValue::Decimal(d) => mysql_async::Value::from(d.to_string()),
        SqlValue::DateTime(dt) => mysql_async::Value::Date(
            dt.year() as u16,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
            dt.nanosecond() / 1_000,
        ),
        SqlValue::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        SqlValue::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1_000,
        ),
    }
}

/// A batch of rows read from the source, ready for insertion.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Rows in this batch (owned for channel transfer).
    pub rows: Vec<Vec<SqlValue>>,

    /// Whether this is the final batch for the table.
    pub is_last: bool,
}

impl Batch {
    /// Create a new batch with the given rows.
    pub fn new(rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            rows,
            is_last: false,
        }
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporal_values_bind_as_wire_temporals() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let dt = date.and_hms_micro_opt(9, 30, 5, 250).unwrap();
        assert_eq!(
            to_mysql_value(&SqlValue::DateTime(dt)),
            mysql_async::Value::Date(2026, 8, 1, 9, 30, 5, 250)
        );
        assert_eq!(
            to_mysql_value(&SqlValue::Date(date)),
            mysql_async::Value::Date(2026, 8, 1, 0, 0, 0, 0)
        );
        let time = NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap();
        assert_eq!(
            to_mysql_value(&SqlValue::Time(time)),
            mysql_async::Value::Time(false, 0, 23, 59, 59, 999_999)
        );
    }

    #[test]
    fn test_null_binds_as_null() {
        let v = to_mysql_value(&SqlValue::Null(SqlNullType::String));
        assert!(matches!(v, mysql_async::Value::NULL));
    }

    #[test]
    fn test_decimal_binds_as_exact_string() {
        let d = Decimal::new(123456, 2); // 1234.56
        let v = to_mysql_value(&SqlValue::Decimal(d));
        assert_eq!(v, mysql_async::Value::from("1234.56"));
    }
}
