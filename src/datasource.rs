//! Data source instances.
//!
//! A [`DataSource`] owns the resolved configuration, the current pool handle and
//! the file watcher of one configured data source. Each `query_data` call first
//! asks the watcher whether the local database file changed and, if it did,
//! rebuilds the pool once before any query of the batch runs. The batch then
//! runs entirely against one snapshot of the handle, so batches already in
//! flight finish on the old pool while later ones see the new one.
//!
//! [`InstanceManager`] caches one data source per UID and recreates it when
//! the settings change.

use crate::config::DataSourceConfig;
use crate::db::executor::run_on_connection;
use crate::db::{Driver, FileWatcher, PoolHandle, QueryExecutor, bootstrap};
use crate::error::{DbError, DbResult};
use crate::models::{CheckHealthResult, QueryDataRequest, QueryDataResponse};
use humansize::{DECIMAL, format_size};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_QUERY_TIMEOUT_SECS;

/// Process-wide options shared by every data source instance.
#[derive(Debug, Clone)]
pub struct DataSourceOptions {
    /// Base directory for DuckDB home, extension and secret directories.
    pub data_dir: Option<PathBuf>,
    pub query_timeout: Duration,
}

impl Default for DataSourceOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }
}

pub struct DataSource {
    instance_id: Uuid,
    config: DataSourceConfig,
    options: DataSourceOptions,
    driver: Arc<dyn Driver>,
    /// `None` once disposed.
    pool: RwLock<Option<Arc<PoolHandle>>>,
    watcher: Mutex<FileWatcher>,
    executor: QueryExecutor,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DataSource {
    /// Bootstrap a data source for an already resolved configuration.
    pub async fn new(
        config: DataSourceConfig,
        driver: Arc<dyn Driver>,
        options: DataSourceOptions,
    ) -> DbResult<Self> {
        let instance_id = Uuid::new_v4();
        let watcher = FileWatcher::new(&config.path);
        let handle = open_pool(&config, driver.clone(), &options).await?;

        info!(
            instance_id = %instance_id,
            target = %config.target_description(),
            watched = watcher.is_local_file(),
            "Data source ready"
        );

        Ok(Self {
            instance_id,
            executor: QueryExecutor::with_timeout(options.query_timeout),
            config,
            options,
            driver,
            pool: RwLock::new(Some(Arc::new(handle))),
            watcher: Mutex::new(watcher),
        })
    }

    /// Resolve settings and secrets, then bootstrap.
    pub async fn from_settings(
        settings: &JsonValue,
        secrets: &JsonValue,
        driver: Arc<dyn Driver>,
        options: DataSourceOptions,
    ) -> DbResult<Self> {
        let config = DataSourceConfig::resolve(settings, secrets)?;
        Self::new(config, driver, options).await
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// Run a batch of queries.
    ///
    /// Fails as a whole only when the call is canceled before dispatch, the
    /// instance is disposed, or a required pool rebuild fails. Query failures
    /// are reported in their own response slots.
    pub async fn query_data(
        &self,
        request: &QueryDataRequest,
        cancel: &CancellationToken,
    ) -> DbResult<QueryDataResponse> {
        if cancel.is_cancelled() {
            return Err(DbError::canceled("query batch"));
        }

        let pool = self.current_pool().await?;

        debug!(
            instance_id = %self.instance_id,
            queries = request.queries.len(),
            "Dispatching query batch"
        );

        Ok(self
            .executor
            .execute_batch(pool, &request.queries, cancel)
            .await)
    }

    /// Probe the current pool with `SELECT 1`.
    pub async fn check_health(&self, cancel: &CancellationToken) -> CheckHealthResult {
        if cancel.is_cancelled() {
            return CheckHealthResult::error(DbError::canceled("health check").to_string());
        }

        let pool = match self.snapshot().await {
            Ok(pool) => pool,
            Err(e) => return CheckHealthResult::error(e.to_string()),
        };

        debug!(
            instance_id = %self.instance_id,
            target = %pool.target(),
            bootstrap = ?pool.bootstrap_state(),
            "Running health check"
        );

        let result = run_on_connection(
            pool,
            self.options.query_timeout,
            cancel,
            "health check",
            |conn| conn.query("SELECT 1").map(|_| ()),
        )
        .await;

        match result {
            Ok(()) => CheckHealthResult::ok(self.health_message()),
            Err(e) => {
                warn!(instance_id = %self.instance_id, error = %e, "Health check failed");
                CheckHealthResult::error(e.to_string())
            }
        }
    }

    /// Release the pool. Batches already running keep their snapshot and finish.
    pub async fn dispose(&self) {
        if let Some(handle) = self.pool.write().await.take() {
            info!(instance_id = %self.instance_id, "Disposing data source");
            handle.close();
        }
    }

    pub async fn is_disposed(&self) -> bool {
        self.pool.read().await.is_none()
    }

    /// Pool to run the next batch on, rebuilding it first if the file changed.
    async fn current_pool(&self) -> DbResult<Arc<PoolHandle>> {
        // Held across the rebuild so concurrent batches wait for the new pool
        // instead of running on the stale one or rebuilding again.
        let mut watcher = self.watcher.lock().await;
        let previous = watcher.last_modified();

        if watcher.has_update() {
            info!(
                instance_id = %self.instance_id,
                path = %self.config.path,
                "Database file changed, reconnecting"
            );

            let handle = match open_pool(&self.config, self.driver.clone(), &self.options).await {
                Ok(handle) => Arc::new(handle),
                Err(e) => {
                    // Report the same change again on the next batch.
                    watcher.restore(previous);
                    warn!(instance_id = %self.instance_id, error = %e, "Reconnect failed");
                    return Err(e);
                }
            };

            let mut slot = self.pool.write().await;
            if slot.is_none() {
                handle.close();
                return Err(disposed_error());
            }
            // The old handle closes when its last in-flight batch drops it.
            *slot = Some(handle);
        }
        drop(watcher);

        self.snapshot().await
    }

    async fn snapshot(&self) -> DbResult<Arc<PoolHandle>> {
        self.pool.read().await.clone().ok_or_else(disposed_error)
    }

    fn health_message(&self) -> String {
        if self.config.is_local_file() {
            match std::fs::metadata(&self.config.path) {
                Ok(meta) => format!(
                    "Data source is working: {} ({})",
                    self.config.target_description(),
                    format_size(meta.len(), DECIMAL)
                ),
                Err(_) => format!(
                    "Data source is working: {}",
                    self.config.target_description()
                ),
            }
        } else {
            format!(
                "Data source is working: {}",
                self.config.target_description()
            )
        }
    }
}

fn disposed_error() -> DbError {
    DbError::connection(
        "data source has been disposed",
        "Re-create the data source instance",
    )
}

async fn open_pool(
    config: &DataSourceConfig,
    driver: Arc<dyn Driver>,
    options: &DataSourceOptions,
) -> DbResult<PoolHandle> {
    let config = config.clone();
    let data_dir = options.data_dir.clone();
    tokio::task::spawn_blocking(move || bootstrap(&config, driver.as_ref(), data_dir.as_deref()))
        .await
        .map_err(|e| DbError::internal(format!("bootstrap worker failed: {}", e)))?
}

// =============================================================================
// Instance Management
// =============================================================================

/// Settings of one configured data source as delivered by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSettings {
    #[serde(default)]
    pub uid: String,
    /// Modification stamp; a different value means the settings changed.
    #[serde(default)]
    pub updated: i64,
    #[serde(default)]
    pub json_data: JsonValue,
    #[serde(default, alias = "secureJsonData")]
    pub decrypted_secure_json_data: JsonValue,
}

struct InstanceEntry {
    updated: i64,
    instance: Arc<DataSource>,
}

/// Caches one [`DataSource`] per UID.
pub struct InstanceManager {
    driver: Arc<dyn Driver>,
    options: DataSourceOptions,
    instances: RwLock<HashMap<String, InstanceEntry>>,
}

impl InstanceManager {
    pub fn new(driver: Arc<dyn Driver>, options: DataSourceOptions) -> Self {
        Self {
            driver,
            options,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Get the instance for `settings`, creating or replacing it as needed.
    ///
    /// A new instance is bootstrapped without holding the cache lock, so a slow
    /// bootstrap of one UID never blocks lookups of the others. If two callers
    /// race to create the same instance, the first one cached wins and the
    /// other is disposed.
    pub async fn get(&self, settings: &InstanceSettings) -> DbResult<Arc<DataSource>> {
        if let Some(instance) = self.cached(settings).await {
            return Ok(instance);
        }

        let instance = Arc::new(
            DataSource::from_settings(
                &settings.json_data,
                &settings.decrypted_secure_json_data,
                self.driver.clone(),
                self.options.clone(),
            )
            .await?,
        );

        let previous = {
            let mut instances = self.instances.write().await;

            // Re-check after acquiring write lock (TOCTOU protection).
            if let Some(entry) = instances.get(&settings.uid) {
                if entry.updated == settings.updated {
                    let winner = entry.instance.clone();
                    drop(instances);
                    debug!(uid = %settings.uid, "Instance created concurrently, discarding duplicate");
                    instance.dispose().await;
                    return Ok(winner);
                }
            }

            instances.insert(
                settings.uid.clone(),
                InstanceEntry {
                    updated: settings.updated,
                    instance: instance.clone(),
                },
            )
        };

        if let Some(old) = previous {
            debug!(
                uid = %settings.uid,
                old_instance = %old.instance.instance_id(),
                "Settings changed, replacing data source instance"
            );
            old.instance.dispose().await;
        }

        Ok(instance)
    }

    async fn cached(&self, settings: &InstanceSettings) -> Option<Arc<DataSource>> {
        let instances = self.instances.read().await;
        instances
            .get(&settings.uid)
            .filter(|entry| entry.updated == settings.updated)
            .map(|entry| entry.instance.clone())
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Dispose every instance.
    pub async fn dispose_all(&self) {
        let mut instances = self.instances.write().await;
        for (uid, entry) in instances.drain() {
            debug!(uid = %uid, "Disposing data source instance");
            entry.instance.dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::RecordingDriver;
    use crate::models::DataQuery;
    use std::fs::File;
    use std::time::SystemTime;
    use tempfile::NamedTempFile;

    fn touch_later(path: &std::path::Path) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
    }

    fn batch(n: usize) -> QueryDataRequest {
        QueryDataRequest {
            queries: (0..n)
                .map(|i| DataQuery::new(format!("q{}", i), "SELECT 1"))
                .collect(),
        }
    }

    async fn file_source(driver: &RecordingDriver, path: &str) -> DataSource {
        let config = DataSourceConfig {
            path: path.to_string(),
            ..Default::default()
        };
        DataSource::new(config, Arc::new(driver.clone()), DataSourceOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_canceled_before_dispatch() {
        let driver = RecordingDriver::new();
        let ds = DataSource::new(
            DataSourceConfig::default(),
            Arc::new(driver.clone()),
            DataSourceOptions::default(),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ds.query_data(&batch(1), &cancel).await.unwrap_err();
        assert!(err.is_canceled());
        assert!(driver.queried().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_on_file_change() {
        let file = NamedTempFile::new().unwrap();
        let driver = RecordingDriver::new();
        let ds = file_source(&driver, file.path().to_str().unwrap()).await;
        assert_eq!(driver.opened_targets().len(), 1);

        ds.query_data(&batch(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(driver.opened_targets().len(), 1);

        touch_later(file.path());
        ds.query_data(&batch(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(driver.opened_targets().len(), 2);
        // The replaced pool was released once no batch held it.
        assert_eq!(driver.closed_pools(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rebuild_once_under_concurrency() {
        let file = NamedTempFile::new().unwrap();
        let driver = RecordingDriver::new();
        let ds = Arc::new(file_source(&driver, file.path().to_str().unwrap()).await);

        touch_later(file.path());

        let handles: Vec<_> = (0..23)
            .map(|_| {
                let ds = ds.clone();
                tokio::spawn(async move {
                    ds.query_data(&batch(3), &CancellationToken::new()).await
                })
            })
            .collect();

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.len(), 3);
        }

        assert_eq!(driver.opened_targets().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_old_pool_and_retries() {
        let file = NamedTempFile::new().unwrap();
        let driver = RecordingDriver::new();
        let path = file.path().to_str().unwrap().to_string();
        let ds = file_source(&driver, &path).await;
        // Every later open is refused.
        let broken = DataSource {
            driver: Arc::new(driver.clone().fail_open()),
            ..ds
        };
        touch_later(file.path());

        let err = broken
            .query_data(&batch(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));

        // The change is reported again, so the next batch retries the rebuild.
        let err = broken
            .query_data(&batch(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(!broken.is_disposed().await);
        assert_eq!(driver.opened_targets().len(), 1);
    }

    #[tokio::test]
    async fn test_dispose() {
        let driver = RecordingDriver::new();
        let ds = DataSource::new(
            DataSourceConfig::default(),
            Arc::new(driver.clone()),
            DataSourceOptions::default(),
        )
        .await
        .unwrap();

        ds.dispose().await;
        assert!(ds.is_disposed().await);
        assert_eq!(driver.closed_pools(), 1);

        let err = ds
            .query_data(&batch(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(!ds.check_health(&CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_health() {
        let driver = RecordingDriver::new();
        let ds = DataSource::new(
            DataSourceConfig::default(),
            Arc::new(driver.clone()),
            DataSourceOptions::default(),
        )
        .await
        .unwrap();

        let result = ds.check_health(&CancellationToken::new()).await;
        assert!(result.is_ok());
        assert!(result.message.contains("in-memory"));
        assert_eq!(driver.queried(), vec!["SELECT 1".to_string()]);
    }

    #[tokio::test]
    async fn test_instance_manager_recreates_on_update() {
        let driver = RecordingDriver::new();
        let manager = InstanceManager::new(Arc::new(driver.clone()), DataSourceOptions::default());
        let mut settings = InstanceSettings {
            uid: "abc".to_string(),
            updated: 1,
            json_data: serde_json::json!({ "path": "" }),
            ..Default::default()
        };

        let first = manager.get(&settings).await.unwrap();
        let again = manager.get(&settings).await.unwrap();
        assert_eq!(first.instance_id(), again.instance_id());

        settings.updated = 2;
        let second = manager.get(&settings).await.unwrap();
        assert_ne!(first.instance_id(), second.instance_id());
        assert!(first.is_disposed().await);
        assert_eq!(manager.len().await, 1);

        manager.dispose_all().await;
        assert!(second.is_disposed().await);
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_instance_manager_surfaces_config_error() {
        let manager = InstanceManager::new(
            Arc::new(RecordingDriver::new()),
            DataSourceOptions::default(),
        );
        let settings = InstanceSettings {
            uid: "bad".to_string(),
            json_data: serde_json::json!({ "path": "'bad_path'" }),
            ..Default::default()
        };
        let err = manager.get(&settings).await.unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
        assert!(err.to_string().contains("'bad_path'"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_bootstrap_does_not_block_other_instances() {
        let driver = RecordingDriver::new().with_open_delay(Duration::from_millis(400));
        let manager = Arc::new(InstanceManager::new(
            Arc::new(driver.clone()),
            DataSourceOptions::default(),
        ));
        let settings = |uid: &str| InstanceSettings {
            uid: uid.to_string(),
            updated: 1,
            json_data: serde_json::json!({ "path": "" }),
            ..Default::default()
        };

        let ready = manager.get(&settings("ready")).await.unwrap();

        let slow_manager = manager.clone();
        let slow = tokio::spawn(async move { slow_manager.get(&settings("slow")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = std::time::Instant::now();
        let cached = manager.get(&settings("ready")).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(cached.instance_id(), ready.instance_id());

        slow.await.unwrap().unwrap();
        assert_eq!(manager.len().await, 2);
        manager.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_keeps_one_instance() {
        let driver = RecordingDriver::new().with_open_delay(Duration::from_millis(50));
        let manager = Arc::new(InstanceManager::new(
            Arc::new(driver.clone()),
            DataSourceOptions::default(),
        ));
        let settings = InstanceSettings {
            uid: "shared".to_string(),
            updated: 1,
            json_data: serde_json::json!({ "path": "" }),
            ..Default::default()
        };

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let settings = settings.clone();
                tokio::spawn(async move { manager.get(&settings).await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().instance_id());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(manager.len().await, 1);

        // Every duplicate that lost the race was closed.
        let opened = driver.opened_targets().len();
        assert_eq!(driver.closed_pools(), opened - 1);
    }
}
