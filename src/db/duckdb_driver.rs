//! DuckDB implementation of the driver capability interface.
//!
//! The `duckdb` crate is synchronous and its `Connection` is `Send` but `!Sync`.
//! A pool keeps one root connection behind a `std::sync::Mutex` and hands out
//! `try_clone()`d connections: every clone shares the same database instance, so
//! extensions, attached catalogs and global settings installed through one of them
//! are visible to all. The root lock is only held while cloning, never while a
//! query runs. Callers are expected to use these types from blocking threads.

use crate::db::driver::{
    ConnectHook, Connection, Driver, Interrupter, Pool, PoolOptions, RawColumn, RawDecimal,
    RawFrame, RawValue,
};
use crate::error::{DbError, DbResult};
use ::duckdb::arrow::array::{Array, AsArray};
use ::duckdb::arrow::datatypes::{
    ArrowPrimitiveType, DataType, Date32Type, Decimal128Type, Float32Type, Float64Type,
    Int8Type, Int16Type, Int32Type, Int64Type, Time64MicrosecondType, Time64NanosecondType,
    TimeUnit, TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
};
use ::duckdb::arrow::record_batch::RecordBatch;
use ::duckdb::arrow::util::display::array_value_to_string;
use chrono::{DateTime, NaiveTime};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Driver backed by the embedded DuckDB engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuckDbDriver;

impl DuckDbDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for DuckDbDriver {
    fn open_pool(
        &self,
        target: &str,
        options: &PoolOptions,
        hook: ConnectHook,
    ) -> DbResult<Arc<dyn Pool>> {
        let config = engine_config(options)?;

        let root = if target.is_empty() {
            ::duckdb::Connection::open_in_memory_with_flags(config)
        } else {
            ::duckdb::Connection::open_with_flags(target, config)
        }
        .map_err(|e| {
            DbError::connection(
                format!("Failed to open DuckDB {}: {}", describe_target(target), e),
                open_suggestion(target),
            )
        })?;

        debug!(target = %describe_target(target), "Opened DuckDB database");

        Ok(Arc::new(DuckDbPool {
            root: Mutex::new(Some(root)),
            hook,
        }))
    }

    fn name(&self) -> &'static str {
        "duckdb"
    }
}

fn engine_config(options: &PoolOptions) -> DbResult<::duckdb::Config> {
    let mut config = ::duckdb::Config::default();
    for (key, value) in &options.engine_settings {
        config = config.with(key, value).map_err(|e| {
            DbError::connection(
                format!("Invalid engine setting '{}': {}", key, e),
                "Remove or correct the setting in the data source configuration",
            )
        })?;
    }
    Ok(config)
}

fn describe_target(target: &str) -> String {
    if target.is_empty() {
        "in-memory database".to_string()
    } else {
        format!("database '{}'", target)
    }
}

fn open_suggestion(target: &str) -> &'static str {
    if target.is_empty() {
        "Check the engine settings of the data source"
    } else {
        "Check that the file exists, is a DuckDB database and is not locked by another process"
    }
}

/// Pool of connections cloned from one root DuckDB connection.
struct DuckDbPool {
    root: Mutex<Option<::duckdb::Connection>>,
    hook: ConnectHook,
}

impl Pool for DuckDbPool {
    fn get(&self) -> DbResult<Box<dyn Connection>> {
        let conn = {
            let root = self
                .root
                .lock()
                .map_err(|_| DbError::internal("DuckDB root connection lock poisoned"))?;
            let root = root.as_ref().ok_or_else(|| {
                DbError::connection("Connection pool is closed", "Reconnect to the data source")
            })?;
            root.try_clone().map_err(|e| {
                DbError::connection(
                    format!("Failed to open DuckDB connection: {}", e),
                    "Check available memory and file handles",
                )
            })?
        }; // Root lock released here

        let conn = DuckDbConnection { conn };
        (self.hook)(&conn)?;
        Ok(Box::new(conn))
    }

    fn close(&self) {
        // Connections already handed out keep the database alive until dropped.
        if let Ok(mut root) = self.root.lock() {
            root.take();
        }
    }
}

struct DuckDbConnection {
    conn: ::duckdb::Connection,
}

impl Connection for DuckDbConnection {
    fn execute(&self, sql: &str) -> DbResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn query(&self, sql: &str) -> DbResult<RawFrame> {
        let mut stmt = self.conn.prepare(sql)?;
        let batches: Vec<RecordBatch> = stmt.query_arrow([])?.collect();

        // The schema is known once the statement ran, even without any batch.
        let schema = stmt.schema();
        let columns: Vec<RawColumn> = schema
            .fields()
            .iter()
            .map(|field| RawColumn::new(field.name().clone(), type_name(field.data_type())))
            .collect();

        let mut rows = Vec::with_capacity(batches.iter().map(RecordBatch::num_rows).sum());
        for batch in &batches {
            for idx in 0..batch.num_rows() {
                let row = batch
                    .columns()
                    .iter()
                    .zip(&columns)
                    .map(|(array, column)| read_value(&column.name, array.as_ref(), idx))
                    .collect::<DbResult<Vec<_>>>()?;
                rows.push(row);
            }
        }

        Ok(RawFrame { columns, rows })
    }

    fn interrupter(&self) -> Interrupter {
        let handle = self.conn.interrupt_handle();
        Arc::new(move || handle.interrupt())
    }
}

/// Map the Arrow type reported by the driver to DuckDB's canonical type name.
pub fn type_name(data_type: &DataType) -> String {
    match data_type {
        DataType::Null => "NULL".to_string(),
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Int8 => "TINYINT".to_string(),
        DataType::Int16 => "SMALLINT".to_string(),
        DataType::Int32 => "INTEGER".to_string(),
        DataType::Int64 => "BIGINT".to_string(),
        DataType::UInt8 => "UTINYINT".to_string(),
        DataType::UInt16 => "USMALLINT".to_string(),
        DataType::UInt32 => "UINTEGER".to_string(),
        DataType::UInt64 => "UBIGINT".to_string(),
        DataType::Float16 | DataType::Float32 => "FLOAT".to_string(),
        DataType::Float64 => "DOUBLE".to_string(),
        DataType::Decimal128(width, scale) | DataType::Decimal256(width, scale) => {
            format!("DECIMAL({},{})", width, scale)
        }
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "VARCHAR".to_string(),
        DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_) => "BLOB".to_string(),
        DataType::Date32 | DataType::Date64 => "DATE".to_string(),
        DataType::Time32(_) | DataType::Time64(_) => "TIME".to_string(),
        DataType::Timestamp(_, None) => "TIMESTAMP".to_string(),
        DataType::Timestamp(_, Some(_)) => "TIMESTAMP WITH TIME ZONE".to_string(),
        DataType::Interval(_) | DataType::Duration(_) => "INTERVAL".to_string(),
        DataType::List(_) | DataType::LargeList(_) => "LIST".to_string(),
        DataType::FixedSizeList(_, _) => "ARRAY".to_string(),
        DataType::Struct(_) => "STRUCT".to_string(),
        DataType::Map(_, _) => "MAP".to_string(),
        DataType::Union(_, _) => "UNION".to_string(),
        DataType::Dictionary(_, _) => "ENUM".to_string(),
        other => format!("{:?}", other).to_uppercase(),
    }
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn primitive<T: ArrowPrimitiveType>(array: &dyn Array, idx: usize) -> Option<T::Native> {
    array.as_primitive_opt::<T>().map(|a| a.value(idx))
}

fn time_of_day(micros: i64) -> Option<NaiveTime> {
    NaiveTime::from_num_seconds_from_midnight_opt(
        u32::try_from(micros / 1_000_000).ok()?,
        u32::try_from((micros % 1_000_000) * 1_000).ok()?,
    )
}

/// Read one cell straight from its Arrow array.
///
/// Decimals keep their unscaled 128-bit value, so every DECIMAL width up to 38
/// digits (and HUGEINT, which arrives as `DECIMAL(38,0)`) is read without loss.
/// Types without a native mapping are rendered through Arrow's display.
fn read_value(column: &str, array: &dyn Array, idx: usize) -> DbResult<RawValue> {
    if array.is_null(idx) {
        return Ok(RawValue::Null);
    }

    let value = match array.data_type() {
        DataType::Boolean => array.as_boolean_opt().map(|a| RawValue::Bool(a.value(idx))),
        DataType::Int8 => primitive::<Int8Type>(array, idx).map(|v| RawValue::Int(v.into())),
        DataType::Int16 => primitive::<Int16Type>(array, idx).map(|v| RawValue::Int(v.into())),
        DataType::Int32 => primitive::<Int32Type>(array, idx).map(|v| RawValue::Int(v.into())),
        DataType::Int64 => primitive::<Int64Type>(array, idx).map(RawValue::Int),
        DataType::UInt8 => primitive::<UInt8Type>(array, idx).map(|v| RawValue::UInt(v.into())),
        DataType::UInt16 => primitive::<UInt16Type>(array, idx).map(|v| RawValue::UInt(v.into())),
        DataType::UInt32 => primitive::<UInt32Type>(array, idx).map(|v| RawValue::UInt(v.into())),
        DataType::UInt64 => primitive::<UInt64Type>(array, idx).map(RawValue::UInt),
        DataType::Float32 => primitive::<Float32Type>(array, idx).map(RawValue::Real),
        DataType::Float64 => primitive::<Float64Type>(array, idx).map(RawValue::Float),
        DataType::Decimal128(width, scale) => primitive::<Decimal128Type>(array, idx).map(|v| {
            RawValue::Decimal(RawDecimal::new(v, *width, u8::try_from(*scale).unwrap_or(0)))
        }),
        DataType::Utf8 => array
            .as_string_opt::<i32>()
            .map(|a| RawValue::Text(a.value(idx).to_string())),
        DataType::LargeUtf8 => array
            .as_string_opt::<i64>()
            .map(|a| RawValue::Text(a.value(idx).to_string())),
        DataType::Binary => array
            .as_binary_opt::<i32>()
            .map(|a| RawValue::Blob(a.value(idx).to_vec())),
        DataType::LargeBinary => array
            .as_binary_opt::<i64>()
            .map(|a| RawValue::Blob(a.value(idx).to_vec())),
        DataType::Date32 => primitive::<Date32Type>(array, idx)
            .and_then(|days| DateTime::from_timestamp(i64::from(days) * 86_400, 0))
            .map(|dt| RawValue::Date(dt.date_naive())),
        DataType::Time64(unit) => match unit {
            TimeUnit::Nanosecond => primitive::<Time64NanosecondType>(array, idx),
            _ => primitive::<Time64MicrosecondType>(array, idx),
        }
        .and_then(|v| time_of_day(to_micros(*unit, v)))
        .map(RawValue::Time),
        DataType::Timestamp(unit, _) => match unit {
            TimeUnit::Second => primitive::<TimestampSecondType>(array, idx),
            TimeUnit::Millisecond => primitive::<TimestampMillisecondType>(array, idx),
            TimeUnit::Microsecond => primitive::<TimestampMicrosecondType>(array, idx),
            TimeUnit::Nanosecond => primitive::<TimestampNanosecondType>(array, idx),
        }
        .and_then(|v| DateTime::from_timestamp_micros(to_micros(*unit, v)))
        .map(RawValue::Timestamp),
        _ => None,
    };

    match value {
        Some(value) => Ok(value),
        None => array_value_to_string(array, idx)
            .map(RawValue::Other)
            .map_err(|e| DbError::conversion(column, type_name(array.data_type()), e.to_string())),
    }
}
