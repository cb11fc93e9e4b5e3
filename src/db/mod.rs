//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Driver capability traits and the DuckDB implementation
//! - One-time connection bootstrapping
//! - Pool handles
//! - Local file change detection
//! - Query execution
//! - Type conversion
//! - Time series reshaping

pub mod bootstrap;
pub mod driver;
pub mod duckdb_driver;
pub mod executor;
pub mod pool;
#[cfg(test)]
pub(crate) mod testing;
pub mod timeseries;
pub mod types;
pub mod watcher;

pub use bootstrap::{BootstrapGuard, BootstrapState};
pub use driver::{Connection, Driver, Interrupter, Pool, RawFrame, RawValue};
pub use duckdb_driver::DuckDbDriver;
pub use executor::QueryExecutor;
pub use pool::{PoolHandle, bootstrap};
pub use types::{FieldType, ScalarValue, TypeRegistry};
pub use watcher::FileWatcher;
