//! Data models for the DuckDB data source.
//!
//! This module re-exports all model types used throughout the application.

pub mod frame;
pub mod health;
pub mod query;

// Re-export commonly used types
pub use frame::{Field, Frame, FrameMeta, TypeInfo};
pub use health::{CheckHealthResult, HealthStatus};
pub use query::{
    DataQuery, DataResponse, QueryDataRequest, QueryDataResponse, QueryFormat, QueryModel,
};
