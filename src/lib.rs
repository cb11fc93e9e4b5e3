//! DuckDB Data Source Library
//!
//! This library exposes embedded DuckDB databases and MotherDuck catalogs
//! through a query-batch and health-check contract.

pub mod config;
pub mod datasource;
pub mod db;
pub mod error;
pub mod models;
pub mod service;
pub mod transport;

pub use config::{Config, DataSourceConfig};
pub use datasource::{DataSource, DataSourceOptions, InstanceManager, InstanceSettings};
pub use error::{DbError, DbResult};
pub use service::DataSourceService;
