//! Connection pool handle.
//!
//! A [`PoolHandle`] owns one driver pool together with the bootstrap guard that
//! prepares its connections. Handles are never shared across data-source
//! instances; a data source swaps its handle wholesale when the file changes.

use crate::config::DataSourceConfig;
use crate::db::bootstrap::{BootstrapGuard, BootstrapState, build_statements, connection_target};
use crate::db::driver::{ConnectHook, Connection, Driver, Pool, PoolOptions};
use crate::error::{DbError, DbResult};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A bootstrapped pool, ready for queries.
pub struct PoolHandle {
    pool: Arc<dyn Pool>,
    guard: Arc<BootstrapGuard>,
    target: String,
    driver: &'static str,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("target", &self.target)
            .field("driver", &self.driver)
            .field("bootstrap", &self.guard.state())
            .finish()
    }
}

impl PoolHandle {
    /// Get a bootstrapped connection.
    pub fn connection(&self) -> DbResult<Box<dyn Connection>> {
        self.pool.get()
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.guard.state()
    }

    /// Physical target; empty for in-memory and MotherDuck databases.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Release the pool. Connections already handed out stay usable until dropped.
    pub fn close(&self) {
        debug!(target = %self.target, "Closing connection pool");
        self.pool.close();
    }
}

// A replaced handle is closed once the last batch holding it finishes.
impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.pool.close();
    }
}

/// Open a pool for `config` and bootstrap it.
///
/// The first connection is requested eagerly so configuration mistakes surface
/// here rather than on the first query. On failure the pool is closed and a
/// connection error is returned.
pub fn bootstrap(
    config: &DataSourceConfig,
    driver: &dyn Driver,
    data_dir: Option<&Path>,
) -> DbResult<PoolHandle> {
    let statements = build_statements(config, data_dir);
    let guard = Arc::new(BootstrapGuard::new(statements));

    let hook_guard = guard.clone();
    let hook: ConnectHook = Arc::new(move |conn: &dyn Connection| hook_guard.ensure(conn));

    let target = connection_target(config).to_string();
    let options = PoolOptions {
        engine_settings: config.engine_settings.clone(),
    };

    debug!(
        driver = driver.name(),
        target = %config.target_description(),
        statements = guard.statements().len(),
        "Opening connection pool"
    );

    let pool = driver.open_pool(&target, &options, hook).map_err(into_connect_error)?;

    if let Err(e) = pool.get() {
        warn!(target = %config.target_description(), error = %e, "Bootstrap failed");
        pool.close();
        return Err(into_connect_error(e));
    }

    info!(
        driver = driver.name(),
        target = %config.target_description(),
        "Connection pool ready"
    );

    Ok(PoolHandle {
        pool,
        guard,
        target,
        driver: driver.name(),
    })
}

fn into_connect_error(err: DbError) -> DbError {
    match err {
        DbError::Connection { .. } => err,
        other => DbError::connection(
            other.to_string(),
            "Check the data source path, token and init SQL",
        ),
    }
}
