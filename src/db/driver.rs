//! Narrow capability interface over the embedded database driver.
//!
//! The bootstrap, watch and execute logic only ever talks to these traits:
//! a [`Driver`] opens a [`Pool`], a pool hands out [`Connection`]s after running
//! the connect hook on them, and a connection executes statements or queries.

use crate::error::DbResult;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Hook run against every newly opened physical connection before it is handed out.
pub type ConnectHook = Arc<dyn Fn(&dyn Connection) -> DbResult<()> + Send + Sync>;

/// Aborts whatever query is running on the connection it was taken from.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// Options forwarded to the driver when a pool is opened.
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// Allow-listed engine settings applied when the database is opened.
    pub engine_settings: BTreeMap<String, String>,
}

/// Opens connection pools.
pub trait Driver: Send + Sync {
    /// Open a pool against `target`; an empty target means an in-memory database.
    fn open_pool(
        &self,
        target: &str,
        options: &PoolOptions,
        hook: ConnectHook,
    ) -> DbResult<Arc<dyn Pool>>;

    /// Driver name for logging.
    fn name(&self) -> &'static str;
}

/// A shareable pool of connections to one database instance.
pub trait Pool: Send + Sync {
    /// Get a connection. The connect hook has already run on it.
    fn get(&self) -> DbResult<Box<dyn Connection>>;

    /// Release the underlying database. Later `get` calls fail.
    fn close(&self);
}

/// One physical connection.
pub trait Connection: Send {
    /// Execute a statement that returns no rows.
    fn execute(&self, sql: &str) -> DbResult<()>;

    /// Run a query and collect its full result.
    fn query(&self, sql: &str) -> DbResult<RawFrame>;

    /// Handle that interrupts a running `query` from another thread.
    ///
    /// An interrupted query returns an error.
    fn interrupter(&self) -> Interrupter;
}

/// A decimal as reported by the driver: unscaled integer, width and scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDecimal {
    pub value: i128,
    pub width: u8,
    pub scale: u8,
}

impl RawDecimal {
    pub fn new(value: i128, width: u8, scale: u8) -> Self {
        Self {
            value,
            width,
            scale,
        }
    }

    /// Convert to a 64-bit float by applying the scale.
    pub fn to_f64(&self) -> f64 {
        self.value as f64 / 10f64.powi(self.scale as i32)
    }
}

impl std::fmt::Display for RawDecimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.value);
        }
        let divisor = 10i128.pow(self.scale as u32);
        let sign = if self.value < 0 { "-" } else { "" };
        let abs = self.value.unsigned_abs();
        let divisor = divisor as u128;
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            abs / divisor,
            abs % divisor,
            width = self.scale as usize
        )
    }
}

/// A value as produced by the driver, before type conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// Single-precision float, kept narrow so its text form stays short.
    Real(f32),
    Float(f64),
    Decimal(RawDecimal),
    Text(String),
    Blob(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    /// Any other value, rendered as text by the driver.
    Other(String),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Textual representation used by the string-based conversion rules.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(v.to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::UInt(v) => Some(v.to_string()),
            Self::Real(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Decimal(v) => Some(v.to_string()),
            Self::Text(v) | Self::Other(v) => Some(v.clone()),
            Self::Blob(v) => Some(String::from_utf8_lossy(v).into_owned()),
            Self::Date(v) => Some(v.to_string()),
            Self::Time(v) => Some(v.to_string()),
            Self::Timestamp(v) => Some(v.to_rfc3339()),
        }
    }
}

/// Column description reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    /// Driver type name, e.g. `INTEGER` or `DECIMAL(18,3)`.
    pub type_name: String,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// A complete, row-oriented query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFrame {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<Vec<RawValue>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_to_f64() {
        assert_eq!(RawDecimal::new(12345, 10, 2).to_f64(), 123.45);
        assert_eq!(RawDecimal::new(-5, 3, 1).to_f64(), -0.5);
        assert_eq!(RawDecimal::new(42, 4, 0).to_f64(), 42.0);
    }

    #[test]
    fn test_decimal_display() {
        assert_eq!(RawDecimal::new(12345, 10, 2).to_string(), "123.45");
        assert_eq!(RawDecimal::new(-5, 3, 2).to_string(), "-0.05");
        assert_eq!(RawDecimal::new(7, 3, 0).to_string(), "7");
    }

    #[test]
    fn test_raw_value_as_text() {
        assert_eq!(RawValue::Null.as_text(), None);
        assert_eq!(RawValue::Int(-3).as_text().as_deref(), Some("-3"));
        assert_eq!(RawValue::Float(1.5).as_text().as_deref(), Some("1.5"));
        assert_eq!(RawValue::Real(1.1).as_text().as_deref(), Some("1.1"));
        assert_eq!(
            RawValue::Text("abc".to_string()).as_text().as_deref(),
            Some("abc")
        );
    }
}
