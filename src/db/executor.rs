//! Query execution engine.
//!
//! This module executes query batches against a bootstrapped pool:
//! - Every query runs on its own blocking worker with its own connection
//! - Queries of one batch run concurrently and fail independently
//! - Per-query timeouts
//! - Caller cancellation, reported as `Canceled` rather than a generic error
//!
//! The driver is synchronous. When the caller stops waiting for a worker,
//! because of a timeout, a cancellation or a dropped request, the query running
//! on that worker is interrupted through its connection.

use crate::db::driver::{Connection, Interrupter, RawFrame, RawValue};
use crate::db::pool::PoolHandle;
use crate::db::timeseries::to_wide;
use crate::db::types::TypeRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{
    DataQuery, DataResponse, Field, Frame, FrameMeta, QueryDataResponse, QueryFormat, TypeInfo,
};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DEFAULT_QUERY_TIMEOUT_SECS;

static NULL_VALUE: RawValue = RawValue::Null;

/// Query executor that handles batch execution.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    default_timeout: Duration,
    registry: Arc<TypeRegistry>,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryExecutor {
    /// Create a new query executor with default settings.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS))
    }

    /// Create a new query executor with a custom per-query timeout.
    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            registry: Arc::new(TypeRegistry::default()),
        }
    }

    /// Execute every query of a batch against `pool`.
    ///
    /// The whole batch uses the given pool. Each query gets its own slot keyed by
    /// refId; when refIds repeat, the later query in the batch wins the slot.
    pub async fn execute_batch(
        &self,
        pool: Arc<PoolHandle>,
        queries: &[DataQuery],
        cancel: &CancellationToken,
    ) -> QueryDataResponse {
        let start = Instant::now();

        let results = join_all(
            queries
                .iter()
                .map(|query| self.execute_query(pool.clone(), query, cancel)),
        )
        .await;

        let mut responses = HashMap::with_capacity(queries.len());
        for (query, response) in queries.iter().zip(results) {
            if responses.insert(query.ref_id.clone(), response).is_some() {
                warn!(
                    ref_id = %query.ref_id,
                    "Duplicate refId in batch, earlier result replaced"
                );
            }
        }

        debug!(
            queries = queries.len(),
            responses = responses.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch executed"
        );

        QueryDataResponse { responses }
    }

    /// Execute one query. Failures are captured in the returned slot.
    pub async fn execute_query(
        &self,
        pool: Arc<PoolHandle>,
        query: &DataQuery,
        cancel: &CancellationToken,
    ) -> DataResponse {
        match self.run(pool, query, cancel).await {
            Ok(frame) => DataResponse::ok(frame),
            Err(e) if e.is_canceled() => {
                debug!(ref_id = %query.ref_id, "Query canceled");
                DataResponse::from_error(&e)
            }
            Err(e) => {
                debug!(ref_id = %query.ref_id, error = %e, "Query failed");
                DataResponse::from_error(&e)
            }
        }
    }

    async fn run(
        &self,
        pool: Arc<PoolHandle>,
        query: &DataQuery,
        cancel: &CancellationToken,
    ) -> DbResult<Frame> {
        let model = query.model()?;
        let format = model.format;
        let sql = model.raw_sql;
        let ref_id = query.ref_id.clone();
        let registry = self.registry.clone();

        debug!(
            ref_id = %ref_id,
            sql = %sql,
            timeout_secs = self.default_timeout.as_secs(),
            "Executing query"
        );

        run_on_connection(
            pool,
            self.default_timeout,
            cancel,
            "query execution",
            move |conn| {
                let raw = conn.query(&sql)?;
                let frame = build_frame(&ref_id, &sql, raw, &registry)?;
                match format {
                    QueryFormat::Table => Ok(frame),
                    QueryFormat::TimeSeries => to_wide(frame),
                }
            },
        )
        .await
    }
}

/// Run `work` on a pooled connection in a blocking worker, bounded by `limit`
/// and `cancel`.
///
/// Once this future stops waiting for the worker, for whatever reason, the
/// connection's running query is interrupted and the worker returns promptly.
/// The worker holds the pool snapshot until then.
pub(crate) async fn run_on_connection<T, F>(
    pool: Arc<PoolHandle>,
    limit: Duration,
    cancel: &CancellationToken,
    operation: &'static str,
    work: F,
) -> DbResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Connection) -> DbResult<T> + Send + 'static,
{
    let slot = Arc::new(InterruptSlot::default());
    let _interrupt_on_exit = InterruptOnDrop(slot.clone());

    let task = tokio::task::spawn_blocking(move || {
        let conn = pool.connection()?;
        if !slot.arm(conn.interrupter()) {
            return Err(DbError::canceled(operation));
        }
        let result = work(conn.as_ref());
        slot.disarm();
        result
    });

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DbError::canceled(operation)),
        result = timeout(limit, task) => match result {
            Err(_) => Err(timeout_error(operation, limit)),
            Ok(Err(join_err)) => Err(DbError::internal(format!(
                "{} worker failed: {}",
                operation, join_err
            ))),
            Ok(Ok(result)) => result,
        },
    }
}

/// Hand-off point between a worker's connection and the task waiting on it.
///
/// Both sides take the same lock: either the worker registers its interrupter
/// before the slot fires and gets interrupted, or it sees the slot already
/// fired and never starts the query.
#[derive(Default)]
struct InterruptSlot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    fired: bool,
    interrupter: Option<Interrupter>,
}

impl InterruptSlot {
    /// Register the running connection. Returns false if the slot already fired.
    fn arm(&self, interrupter: Interrupter) -> bool {
        let mut state = self.lock();
        if state.fired {
            return false;
        }
        state.interrupter = Some(interrupter);
        true
    }

    fn disarm(&self) {
        self.lock().interrupter = None;
    }

    fn fire(&self) {
        let interrupter = {
            let mut state = self.lock();
            state.fired = true;
            state.interrupter.take()
        };
        if let Some(interrupt) = interrupter {
            debug!("Interrupting abandoned query");
            interrupt();
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct InterruptOnDrop(Arc<InterruptSlot>);

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}

/// Convert a raw driver result into a columnar frame.
pub fn build_frame(
    name: &str,
    sql: &str,
    raw: RawFrame,
    registry: &TypeRegistry,
) -> DbResult<Frame> {
    let row_count = raw.rows.len();
    let mut fields = Vec::with_capacity(raw.columns.len());

    for (idx, column) in raw.columns.iter().enumerate() {
        let values = raw
            .rows
            .iter()
            .map(|row| row.get(idx).unwrap_or(&NULL_VALUE));
        let (field_type, values) = registry.convert_column(column, values)?;
        fields.push(Field {
            name: column.name.clone(),
            field_type,
            type_info: TypeInfo {
                db_type: column.type_name.clone(),
            },
            labels: BTreeMap::new(),
            values,
        });
    }

    Ok(Frame {
        name: name.to_string(),
        fields,
        meta: FrameMeta {
            executed_query_string: sql.to_string(),
            row_count,
        },
    })
}

fn timeout_error(operation: &str, elapsed: Duration) -> DbError {
    DbError::timeout(operation, elapsed.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSourceConfig;
    use crate::db::driver::RawColumn;
    use crate::db::pool::bootstrap;
    use crate::db::testing::RecordingDriver;
    use crate::db::types::{FieldType, ScalarValue};

    fn pool_with(driver: &RecordingDriver) -> Arc<PoolHandle> {
        Arc::new(bootstrap(&DataSourceConfig::default(), driver, None).unwrap())
    }

    #[test]
    fn test_build_frame() {
        let raw = RawFrame {
            columns: vec![RawColumn::new("a", "INTEGER"), RawColumn::new("b", "VARCHAR")],
            rows: vec![
                vec![RawValue::Int(1), RawValue::Text("x".into())],
                vec![RawValue::Int(2)],
            ],
        };
        let frame = build_frame("A", "SELECT a, b", raw, &TypeRegistry::default()).unwrap();
        assert_eq!(frame.row_count(), 2);
        assert_eq!(frame.fields[0].field_type, FieldType::NullableInt64);
        assert_eq!(
            frame.fields[1].values,
            vec![ScalarValue::String("x".into()), ScalarValue::Null]
        );
        assert_eq!(frame.meta.executed_query_string, "SELECT a, b");
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let driver = RecordingDriver::new().fail_on("BROKEN");
        let executor = QueryExecutor::new();
        let queries = vec![
            DataQuery::new("A", "SELECT 1"),
            DataQuery::new("B", "BROKEN"),
            DataQuery::new("C", "SELECT 3"),
        ];

        let response = executor
            .execute_batch(pool_with(&driver), &queries, &CancellationToken::new())
            .await;

        assert_eq!(response.len(), 3);
        assert!(!response.get("A").unwrap().is_error());
        assert!(response.get("B").unwrap().is_error());
        assert!(!response.get("C").unwrap().is_error());
    }

    #[tokio::test]
    async fn test_duplicate_ref_ids_last_wins() {
        let driver = RecordingDriver::new().fail_on("BROKEN");
        let executor = QueryExecutor::new();
        let queries = vec![
            DataQuery::new("dup", "BROKEN"),
            DataQuery::new("dup", "SELECT 1"),
        ];

        let response = executor
            .execute_batch(pool_with(&driver), &queries, &CancellationToken::new())
            .await;

        assert_eq!(response.len(), 1);
        assert!(!response.get("dup").unwrap().is_error());
    }

    #[tokio::test]
    async fn test_invalid_payload_is_isolated() {
        let driver = RecordingDriver::new();
        let queries = vec![
            DataQuery::new("A", ""),
            DataQuery::new("B", "SELECT 1"),
        ];
        let response = QueryExecutor::new()
            .execute_batch(pool_with(&driver), &queries, &CancellationToken::new())
            .await;
        assert_eq!(response.get("A").unwrap().status, 400);
        assert!(!response.get("B").unwrap().is_error());
    }

    async fn wait_for_interrupts(driver: &RecordingDriver, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while driver.interrupted_queries() < expected && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(driver.interrupted_queries(), expected);
    }

    #[tokio::test]
    async fn test_timeout() {
        let driver = RecordingDriver::new().with_delay(Duration::from_secs(30));
        let executor = QueryExecutor::with_timeout(Duration::from_millis(100));
        let response = executor
            .execute_batch(
                pool_with(&driver),
                &[DataQuery::new("A", "SELECT 1")],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(response.get("A").unwrap().status, 504);

        // The abandoned worker stops instead of sleeping out the full delay.
        wait_for_interrupts(&driver, 1).await;
    }

    #[tokio::test]
    async fn test_cancel_mid_flight() {
        let driver = RecordingDriver::new().with_delay(Duration::from_secs(30));
        let executor = QueryExecutor::new();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let response = executor
            .execute_batch(
                pool_with(&driver),
                &[DataQuery::new("A", "SELECT 1"), DataQuery::new("B", "SELECT 2")],
                &cancel,
            )
            .await;
        assert_eq!(response.len(), 2);
        assert_eq!(response.get("A").unwrap().status, 499);
        assert_eq!(response.get("B").unwrap().status, 499);
        wait_for_interrupts(&driver, 2).await;
    }

    #[tokio::test]
    async fn test_dropped_batch_interrupts_queries() {
        let driver = RecordingDriver::new().with_delay(Duration::from_secs(30));
        let executor = QueryExecutor::new();
        let pool = pool_with(&driver);
        let queries = [DataQuery::new("A", "SELECT 1")];
        let cancel = CancellationToken::new();

        let batch = executor.execute_batch(pool, &queries, &cancel);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), batch)
                .await
                .is_err()
        );
        wait_for_interrupts(&driver, 1).await;
    }

    #[tokio::test]
    async fn test_time_series_requires_time_column() {
        let driver = RecordingDriver::new();
        let query = DataQuery {
            ref_id: "A".to_string(),
            json: serde_json::json!({ "rawSql": "SELECT 1", "format": "time_series" }),
        };
        let response = QueryExecutor::new()
            .execute_batch(pool_with(&driver), &[query], &CancellationToken::new())
            .await;
        let slot = response.get("A").unwrap();
        assert_eq!(slot.status, 400);
        assert!(slot.error.as_deref().unwrap().contains("time column"));
    }
}
