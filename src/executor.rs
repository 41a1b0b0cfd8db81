//! Pooled statement execution with classified retries.
//!
//! Each attempt runs on its own tokio task holding one pooled connection, so
//! concurrency is bounded by the pool size. Dropping the future returned by
//! [`QueryExecutor::execute`] does not abort an attempt that is already
//! running.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::compiler::{
    compile_aggregation, compile_query, reshape_aggregate_rows, AggregateRow, AggregationSpec,
    ParameterMap, QuerySpec,
};
use crate::config::EngineConfig;
use crate::db::placeholder::bind;
use crate::db::{
    Connection, ConnectionPool, Connector, PgConnector, PlaceholderStyle, PoolOptions, RawResult,
};
use crate::error::{classify, EngineError, EngineErrorKind, QueryError, Result};
use crate::metrics::{MetricsSink, TracingSink};
use crate::retry::RetryPolicy;
use crate::schema::TableSchema;
use crate::value::{Row, Value};

/// Kind of request an execution serves, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Single,
    List,
    Aggregate,
    Custom,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Single,
        OperationKind::List,
        OperationKind::Aggregate,
        OperationKind::Custom,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Single => "single",
            OperationKind::List => "list",
            OperationKind::Aggregate => "aggregate",
            OperationKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Per-request bookkeeping threaded through logs and metrics.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub correlation_id: String,
    pub operation: OperationKind,
    pub table: Option<String>,
    pub started_at: Instant,
}

impl ExecutionContext {
    pub fn new(operation: OperationKind, table: Option<&str>) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            operation,
            table: table.map(str::to_string),
            started_at: Instant::now(),
        }
    }

    pub fn custom() -> Self {
        Self::new(OperationKind::Custom, None)
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Rows returned by one statement, with values normalized for transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    pub row_count: usize,
}

impl QueryOutcome {
    fn from_raw(raw: RawResult) -> Self {
        let RawResult { columns, rows } = raw;
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|values| {
                if values.len() != columns.len() {
                    debug!(
                        columns = columns.len(),
                        values = values.len(),
                        "row width differs from column count"
                    );
                }
                let mut values = values.into_iter().map(Value::normalized);
                columns
                    .iter()
                    .map(|name| (name.clone(), values.next().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();
        Self {
            row_count: rows.len(),
            rows,
            columns,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorOptions {
    pub retry: RetryPolicy,
    /// Executions slower than this are reported as slow.
    pub slow_query_threshold: Duration,
    pub log_slow_queries: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            slow_query_threshold: Duration::from_secs(1),
            log_slow_queries: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorStats {
    pub query_count: u64,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
    pub pool_size: usize,
    pub max_retries: u32,
    pub slow_query_threshold_ms: u64,
}

struct Inner<C: Connector> {
    pool: ConnectionPool<C>,
    style: PlaceholderStyle,
    options: ExecutorOptions,
    sink: Arc<dyn MetricsSink>,
    query_count: AtomicU64,
    total_time_us: AtomicU64,
    closed: AtomicBool,
}

impl<C: Connector> Inner<C> {
    async fn attempt(&self, sql: &str, values: &[Value]) -> std::result::Result<RawResult, EngineError> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.query(sql, values).await;
        conn.release();
        result
    }
}

/// Runs compiled statements against a connection pool.
pub struct QueryExecutor<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for QueryExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> QueryExecutor<C> {
    pub fn new(pool: ConnectionPool<C>, options: ExecutorOptions) -> Self {
        Self::with_sink(pool, options, Arc::new(TracingSink))
    }

    pub fn with_sink(
        pool: ConnectionPool<C>,
        options: ExecutorOptions,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                style: pool.placeholder_style(),
                pool,
                options,
                sink,
                query_count: AtomicU64::new(0),
                total_time_us: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.inner.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.options.retry
    }

    /// Run `sql` (with `$p<N>` tokens) and return its rows.
    pub async fn execute(
        &self,
        sql: &str,
        params: &ParameterMap,
        ctx: ExecutionContext,
    ) -> Result<QueryOutcome> {
        let inner = &self.inner;

        if inner.closed.load(Ordering::SeqCst) {
            return Err(QueryError::connection("Query executor is closed")
                .with_correlation_id(ctx.correlation_id));
        }

        inner.sink.on_start(&ctx, sql);

        let result = match bind(sql, params, inner.style) {
            Ok((native_sql, values)) => self
                .run_attempts(native_sql.into(), values.into(), &ctx)
                .await
                .map_err(|e| classify(&e, ctx.table.as_deref())),
            Err(e) => Err(e),
        };

        let elapsed = ctx.elapsed();
        inner.query_count.fetch_add(1, Ordering::Relaxed);
        inner
            .total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        if inner.options.log_slow_queries && elapsed > inner.options.slow_query_threshold {
            inner.sink.on_slow_query(&ctx, sql, elapsed);
        }

        match result {
            Ok(raw) => {
                let outcome = QueryOutcome::from_raw(raw);
                inner.sink.on_success(&ctx, outcome.row_count, elapsed);
                Ok(outcome)
            }
            Err(e) => {
                let err = e
                    .with_sql(sql)
                    .with_correlation_id(ctx.correlation_id.clone());
                inner.sink.on_failure(&ctx, &err, elapsed);
                Err(err)
            }
        }
    }

    /// Run a bound statement under the retry policy, one spawned task per
    /// attempt.
    async fn run_attempts(
        &self,
        sql: Arc<str>,
        values: Arc<[Value]>,
        ctx: &ExecutionContext,
    ) -> std::result::Result<RawResult, EngineError> {
        let inner = &self.inner;
        inner
            .options
            .retry
            .run(
                |_| {
                    let inner = inner.clone();
                    let sql = sql.clone();
                    let values = values.clone();
                    async move {
                        tokio::spawn(async move { inner.attempt(&sql, &values).await })
                            .await
                            .unwrap_or_else(|e| {
                                Err(EngineError::new(
                                    EngineErrorKind::Other,
                                    format!("query worker failed: {}", e),
                                ))
                            })
                    }
                },
                |attempt, err, delay| inner.sink.on_retry(ctx, attempt, err, delay),
            )
            .await
    }

    /// Run several statements concurrently. Results line up with the input;
    /// execution order is unspecified.
    pub async fn execute_many(
        &self,
        statements: Vec<(String, ParameterMap, ExecutionContext)>,
    ) -> Vec<Result<QueryOutcome>> {
        let handles: Vec<_> = statements
            .into_iter()
            .map(|(sql, params, ctx)| {
                let this = self.clone();
                let id = ctx.correlation_id.clone();
                let handle = tokio::spawn(async move { this.execute(&sql, &params, ctx).await });
                (id, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            results.push(handle.await.unwrap_or_else(|e| {
                Err(QueryError::query(format!("Query task failed: {}", e)).with_correlation_id(id))
            }));
        }
        results
    }

    /// Compile and run a row query.
    pub async fn query(&self, spec: &QuerySpec) -> Result<QueryOutcome> {
        let (sql, params) = compile_query(spec)?;
        let operation = if spec.limit == Some(1) {
            OperationKind::Single
        } else {
            OperationKind::List
        };
        self.execute(&sql, &params, ExecutionContext::new(operation, Some(&spec.table)))
            .await
    }

    /// Compile and run an aggregation, then reshape its rows.
    pub async fn aggregate(
        &self,
        spec: &AggregationSpec,
        schema: &TableSchema,
    ) -> Result<Vec<AggregateRow>> {
        let (sql, params) = compile_aggregation(spec, schema)?;
        let ctx = ExecutionContext::new(OperationKind::Aggregate, Some(&spec.table));
        let outcome = self.execute(&sql, &params, ctx).await?;
        Ok(reshape_aggregate_rows(outcome.rows, spec, schema))
    }

    pub fn stats(&self) -> ExecutorStats {
        let inner = &self.inner;
        let query_count = inner.query_count.load(Ordering::Relaxed);
        let total_time_ms = inner.total_time_us.load(Ordering::Relaxed) as f64 / 1000.0;
        ExecutorStats {
            query_count,
            total_time_ms,
            avg_time_ms: if query_count > 0 {
                total_time_ms / query_count as f64
            } else {
                0.0
            },
            pool_size: inner.pool.size(),
            max_retries: inner.options.retry.max_retries,
            slow_query_threshold_ms: inner.options.slow_query_threshold.as_millis() as u64,
        }
    }

    /// Shut down the pool. Later calls are no-ops.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pool.shutdown();
        info!("query executor closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl QueryExecutor<PgConnector> {
    /// Open a PostgreSQL pool described by `config`.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let connector = PgConnector::new(config.resolved_connection());
        let pool = ConnectionPool::new(connector, config.pool_options())
            .await
            .map_err(|e| classify(&e, None))?;
        Ok(Self::new(pool, config.executor_options()))
    }
}

/// Blocking front end over [`QueryExecutor`].
///
/// Owns a multi-threaded runtime sized to the pool; every call blocks the
/// current thread until the statement finishes. Must not be used from inside
/// an async context.
pub struct BlockingExecutor<C: Connector> {
    executor: QueryExecutor<C>,
    runtime: Runtime,
}

impl<C: Connector> BlockingExecutor<C> {
    pub fn connect(connector: C, pool: PoolOptions, options: ExecutorOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(pool.size.max(1))
            .thread_name("pgrquery-worker")
            .enable_all()
            .build()
            .map_err(|e| QueryError::connection(format!("Failed to start worker runtime: {}", e)))?;
        let pool = runtime
            .block_on(ConnectionPool::new(connector, pool))
            .map_err(|e| classify(&e, None))?;
        Ok(Self {
            executor: QueryExecutor::new(pool, options),
            runtime,
        })
    }

    pub fn from_executor(runtime: Runtime, executor: QueryExecutor<C>) -> Self {
        Self { executor, runtime }
    }

    pub fn execute(
        &self,
        sql: &str,
        params: &ParameterMap,
        ctx: ExecutionContext,
    ) -> Result<QueryOutcome> {
        self.runtime.block_on(self.executor.execute(sql, params, ctx))
    }

    pub fn execute_many(
        &self,
        statements: Vec<(String, ParameterMap, ExecutionContext)>,
    ) -> Vec<Result<QueryOutcome>> {
        self.runtime.block_on(self.executor.execute_many(statements))
    }

    pub fn query(&self, spec: &QuerySpec) -> Result<QueryOutcome> {
        self.runtime.block_on(self.executor.query(spec))
    }

    pub fn aggregate(&self, spec: &AggregationSpec, schema: &TableSchema) -> Result<Vec<AggregateRow>> {
        self.runtime.block_on(self.executor.aggregate(spec, schema))
    }

    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn close(&self) {
        self.executor.close();
    }

    pub fn executor(&self) -> &QueryExecutor<C> {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_normalizes_values() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let raw = RawResult {
            columns: vec!["id".into(), "born".into(), "blob".into()],
            rows: vec![vec![
                Value::Int(1),
                Value::Date(date),
                Value::Bytes(b"hi".to_vec()),
            ]],
        };
        let outcome = QueryOutcome::from_raw(raw);
        assert_eq!(outcome.row_count, 1);
        assert_eq!(outcome.columns, vec!["id", "born", "blob"]);
        assert_eq!(
            serde_json::to_value(&outcome.rows[0]).unwrap(),
            json!({ "id": 1, "born": "2024-01-02", "blob": "hi" })
        );
    }

    #[test]
    fn test_outcome_pads_short_rows_with_null() {
        let raw = RawResult {
            columns: vec!["id".into(), "name".into(), "email".into()],
            rows: vec![vec![Value::Int(7)]],
        };
        let outcome = QueryOutcome::from_raw(raw);
        let row = &outcome.rows[0];
        assert_eq!(row.len(), 3);
        assert_eq!(row["id"], Value::Int(7));
        assert_eq!(row["name"], Value::Null);
        assert_eq!(row["email"], Value::Null);
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = ExecutionContext::new(OperationKind::List, Some("users"));
        let b = ExecutionContext::new(OperationKind::List, Some("users"));
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(a.table.as_deref(), Some("users"));
        assert_eq!(OperationKind::Aggregate.to_string(), "aggregate");
    }
}
