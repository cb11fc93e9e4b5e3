//! Columnar result frames.

use crate::db::types::{FieldType, ScalarValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One column of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub type_info: TypeInfo,
    /// Series labels; only set on value fields of reshaped time series.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub values: Vec<ScalarValue>,
}

/// Source type of a field as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeInfo {
    pub db_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    pub executed_query_string: String,
    pub row_count: usize,
}

/// Columnar query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    pub fields: Vec<Field>,
    pub meta: FrameMeta,
}

impl Frame {
    pub fn row_count(&self) -> usize {
        self.meta.row_count
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}
