//! Type conversion registry.
//!
//! Raw driver values are coerced into nullable scalars in two steps:
//! 1. A priority-ordered table of [`ConversionRule`]s is consulted with the
//!    driver-reported column type name; the first rule whose matcher accepts the
//!    name converts every value of the column.
//! 2. Columns no rule claims use the default conversion, chosen from the
//!    column's [`FieldType`].
//!
//! Every converter handles null explicitly and reports malformed input as a
//! conversion error instead of panicking.

use crate::db::driver::{RawColumn, RawValue};
use crate::error::{DbError, DbResult};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

// =============================================================================
// Canonical Scalars
// =============================================================================

/// Canonical nullable scalar kind of a response field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    NullableBool,
    NullableInt16,
    NullableInt64,
    NullableUint64,
    NullableFloat64,
    NullableString,
    NullableTime,
}

/// A converted value. `Null` is distinct from every valid value of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int64(i64),
    Uint64(u64),
    Float64(f64),
    Time(DateTime<Utc>),
    String(String),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

type Converter = fn(&RawValue) -> Result<ScalarValue, String>;

// =============================================================================
// Conversion Rules
// =============================================================================

/// How a rule selects columns by driver type name.
#[derive(Debug, Clone)]
pub enum TypeMatcher {
    /// Case-insensitive match against one of the listed names.
    Exact(&'static [&'static str]),
    Pattern(Regex),
}

impl TypeMatcher {
    pub fn matches(&self, type_name: &str) -> bool {
        match self {
            Self::Exact(names) => names.iter().any(|n| n.eq_ignore_ascii_case(type_name)),
            Self::Pattern(re) => re.is_match(type_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversionRule {
    pub name: &'static str,
    pub matcher: TypeMatcher,
    pub output: FieldType,
    convert: Converter,
}

impl ConversionRule {
    pub fn convert(&self, value: &RawValue) -> Result<ScalarValue, String> {
        (self.convert)(value)
    }
}

const FLOAT_TYPES: &[&str] = &["FLOAT", "FLOAT4", "FLOAT8", "FLOAT32"];

// INT8 is a BIGINT alias in DuckDB and is left to the default conversion.
const SMALL_INT_TYPES: &[&str] = &["INT2", "INT16", "TINYINT", "SMALLINT"];

static DECIMAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^DECIMAL.*").unwrap());

fn convert_float(value: &RawValue) -> Result<ScalarValue, String> {
    let Some(text) = value.as_text() else {
        return Ok(ScalarValue::Null);
    };
    text.trim()
        .parse::<f64>()
        .map(ScalarValue::Float64)
        .map_err(|e| format!("cannot parse '{}' as float: {}", text, e))
}

fn convert_small_int(value: &RawValue) -> Result<ScalarValue, String> {
    let Some(text) = value.as_text() else {
        return Ok(ScalarValue::Null);
    };
    text.trim()
        .parse::<i16>()
        .map(ScalarValue::Int16)
        .map_err(|e| format!("cannot parse '{}' as 16-bit integer: {}", text, e))
}

fn convert_decimal(value: &RawValue) -> Result<ScalarValue, String> {
    match value {
        RawValue::Decimal(d) => Ok(ScalarValue::Float64(d.to_f64())),
        // Null or anything that is not a structured decimal is an invalid holder.
        _ => Ok(ScalarValue::Null),
    }
}

/// Ordered rule table. The first matching rule wins.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    rules: Vec<ConversionRule>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self {
            rules: vec![
                ConversionRule {
                    name: "float",
                    matcher: TypeMatcher::Exact(FLOAT_TYPES),
                    output: FieldType::NullableFloat64,
                    convert: convert_float,
                },
                ConversionRule {
                    name: "small_int",
                    matcher: TypeMatcher::Exact(SMALL_INT_TYPES),
                    output: FieldType::NullableInt16,
                    convert: convert_small_int,
                },
                ConversionRule {
                    name: "decimal",
                    matcher: TypeMatcher::Pattern(DECIMAL_PATTERN.clone()),
                    output: FieldType::NullableFloat64,
                    convert: convert_decimal,
                },
            ],
        }
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rule applying to a driver type name, if any.
    pub fn rule_for(&self, type_name: &str) -> Option<&ConversionRule> {
        self.rules.iter().find(|r| r.matcher.matches(type_name))
    }

    /// Convert one column's values.
    pub fn convert_column<'a>(
        &self,
        column: &RawColumn,
        values: impl Iterator<Item = &'a RawValue>,
    ) -> DbResult<(FieldType, Vec<ScalarValue>)> {
        let to_error =
            |message: String| DbError::conversion(&column.name, &column.type_name, message);

        match self.rule_for(&column.type_name) {
            Some(rule) => {
                let converted = values
                    .map(|v| rule.convert(v).map_err(to_error))
                    .collect::<DbResult<Vec<_>>>()?;
                Ok((rule.output, converted))
            }
            None => {
                let field_type = default_field_type(&column.type_name);
                let converted = values
                    .map(|v| default_convert(field_type, v).map_err(to_error))
                    .collect::<DbResult<Vec<_>>>()?;
                Ok((field_type, converted))
            }
        }
    }
}

// =============================================================================
// Default Conversion
// =============================================================================

/// Field type for columns no rule claims, by DuckDB type name.
pub fn default_field_type(type_name: &str) -> FieldType {
    let upper = type_name.to_uppercase();
    match upper.as_str() {
        "BOOLEAN" | "BOOL" => FieldType::NullableBool,
        "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "INT8" => FieldType::NullableInt64,
        "UTINYINT" | "USMALLINT" | "UINTEGER" | "UBIGINT" => FieldType::NullableUint64,
        "HUGEINT" | "UHUGEINT" | "DOUBLE" | "FLOAT" | "REAL" => FieldType::NullableFloat64,
        "DATE" => FieldType::NullableTime,
        t if t.starts_with("TIMESTAMP") => FieldType::NullableTime,
        t if t.starts_with("DECIMAL") => FieldType::NullableFloat64,
        _ => FieldType::NullableString,
    }
}

fn default_convert(field_type: FieldType, value: &RawValue) -> Result<ScalarValue, String> {
    if value.is_null() {
        return Ok(ScalarValue::Null);
    }

    let mismatch = || format!("unexpected value {:?} for {:?}", value, field_type);

    match field_type {
        FieldType::NullableBool => match value {
            RawValue::Bool(b) => Ok(ScalarValue::Bool(*b)),
            _ => Err(mismatch()),
        },
        FieldType::NullableInt16 => match value {
            RawValue::Int(i) => i16::try_from(*i)
                .map(ScalarValue::Int16)
                .map_err(|e| e.to_string()),
            _ => Err(mismatch()),
        },
        FieldType::NullableInt64 => match value {
            RawValue::Int(i) => Ok(ScalarValue::Int64(*i)),
            RawValue::UInt(u) => i64::try_from(*u)
                .map(ScalarValue::Int64)
                .map_err(|e| e.to_string()),
            _ => Err(mismatch()),
        },
        FieldType::NullableUint64 => match value {
            RawValue::UInt(u) => Ok(ScalarValue::Uint64(*u)),
            RawValue::Int(i) => u64::try_from(*i)
                .map(ScalarValue::Uint64)
                .map_err(|e| e.to_string()),
            _ => Err(mismatch()),
        },
        FieldType::NullableFloat64 => match value {
            RawValue::Float(f) => Ok(ScalarValue::Float64(*f)),
            RawValue::Real(f) => Ok(ScalarValue::Float64(f64::from(*f))),
            RawValue::Int(i) => Ok(ScalarValue::Float64(*i as f64)),
            RawValue::UInt(u) => Ok(ScalarValue::Float64(*u as f64)),
            RawValue::Decimal(d) => Ok(ScalarValue::Float64(d.to_f64())),
            _ => Err(mismatch()),
        },
        FieldType::NullableTime => match value {
            RawValue::Timestamp(ts) => Ok(ScalarValue::Time(*ts)),
            RawValue::Date(d) => Ok(ScalarValue::Time(date_at_midnight(*d))),
            _ => Err(mismatch()),
        },
        FieldType::NullableString => Ok(match value {
            RawValue::Blob(bytes) => encode_binary_value(bytes),
            other => other
                .as_text()
                .map(ScalarValue::String)
                .unwrap_or(ScalarValue::Null),
        }),
    }
}

fn date_at_midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Encode binary data as a base64 string scalar.
pub fn encode_binary_value(bytes: &[u8]) -> ScalarValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    ScalarValue::String(STANDARD.encode(bytes))
}
