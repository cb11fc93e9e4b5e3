//! Query-related data models.
//!
//! This module defines the query batch request and the per-refId response map.

use crate::error::{DbError, DbResult};
use crate::models::frame::Frame;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// A batch of independent queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryDataRequest {
    #[serde(default)]
    pub queries: Vec<DataQuery>,
}

/// One query of a batch. `ref_id` is caller-supplied and need not be unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    #[serde(alias = "refID")]
    pub ref_id: String,
    /// Query payload; holds at least `rawSql`.
    #[serde(default)]
    pub json: JsonValue,
}

impl DataQuery {
    pub fn new(ref_id: impl Into<String>, raw_sql: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            json: serde_json::json!({ "rawSql": raw_sql.into() }),
        }
    }

    /// Parse the embedded payload.
    pub fn model(&self) -> DbResult<QueryModel> {
        let model: QueryModel = serde_json::from_value(self.json.clone())?;
        if model.raw_sql.trim().is_empty() {
            return Err(DbError::invalid_input("rawSql must not be empty"));
        }
        Ok(model)
    }
}

/// Result shape requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFormat {
    #[default]
    Table,
    TimeSeries,
}

/// Query payload embedded in [`DataQuery::json`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryModel {
    #[serde(default)]
    pub raw_sql: String,
    #[serde(default)]
    pub format: QueryFormat,
}

/// Outcome of one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataResponse {
    #[serde(default)]
    pub frames: Vec<Frame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: u16,
}

impl DataResponse {
    pub fn ok(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
            error: None,
            status: 200,
        }
    }

    /// Response slot for a failed query.
    pub fn from_error(err: &DbError) -> Self {
        Self {
            frames: Vec::new(),
            error: Some(err.to_string()),
            status: status_for(err),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

fn status_for(err: &DbError) -> u16 {
    match err {
        DbError::InvalidInput { .. } | DbError::Database { .. } | DbError::Config { .. } => 400,
        DbError::Canceled { .. } => 499,
        DbError::Timeout { .. } => 504,
        DbError::Connection { .. } => 502,
        DbError::Conversion { .. } | DbError::Internal { .. } => 500,
    }
}

/// Responses keyed by refId. Duplicate refIds share one slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryDataResponse {
    pub responses: HashMap<String, DataResponse>,
}

impl QueryDataResponse {
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn get(&self, ref_id: &str) -> Option<&DataResponse> {
        self.responses.get(ref_id)
    }
}
