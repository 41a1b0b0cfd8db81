//! Execution events reported by the executor.
//!
//! The executor reports each statement's start, retries, outcome and slow
//! executions to a [`MetricsSink`]. [`TracingSink`] turns them into log
//! events; [`MetricsCollector`] keeps a bounded in-memory history and
//! aggregate statistics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EngineError, QueryError};
use crate::executor::{ExecutionContext, OperationKind};

const DEFAULT_MAX_HISTORY: usize = 10_000;
const RECENT_LIMIT: usize = 10;

/// Receiver of executor events. Every method defaults to a no-op.
pub trait MetricsSink: Send + Sync {
    fn on_start(&self, _ctx: &ExecutionContext, _sql: &str) {}

    fn on_retry(
        &self,
        _ctx: &ExecutionContext,
        _attempt: u32,
        _error: &EngineError,
        _delay: Duration,
    ) {
    }

    fn on_success(&self, _ctx: &ExecutionContext, _row_count: usize, _duration: Duration) {}

    fn on_failure(&self, _ctx: &ExecutionContext, _error: &QueryError, _duration: Duration) {}

    fn on_slow_query(&self, _ctx: &ExecutionContext, _sql: &str, _duration: Duration) {}
}

impl<T: MetricsSink + ?Sized> MetricsSink for Arc<T> {
    fn on_start(&self, ctx: &ExecutionContext, sql: &str) {
        (**self).on_start(ctx, sql)
    }

    fn on_retry(&self, ctx: &ExecutionContext, attempt: u32, error: &EngineError, delay: Duration) {
        (**self).on_retry(ctx, attempt, error, delay)
    }

    fn on_success(&self, ctx: &ExecutionContext, row_count: usize, duration: Duration) {
        (**self).on_success(ctx, row_count, duration)
    }

    fn on_failure(&self, ctx: &ExecutionContext, error: &QueryError, duration: Duration) {
        (**self).on_failure(ctx, error, duration)
    }

    fn on_slow_query(&self, ctx: &ExecutionContext, sql: &str, duration: Duration) {
        (**self).on_slow_query(ctx, sql, duration)
    }
}

/// Forward every event to both sinks.
impl<A: MetricsSink, B: MetricsSink> MetricsSink for (A, B) {
    fn on_start(&self, ctx: &ExecutionContext, sql: &str) {
        self.0.on_start(ctx, sql);
        self.1.on_start(ctx, sql);
    }

    fn on_retry(&self, ctx: &ExecutionContext, attempt: u32, error: &EngineError, delay: Duration) {
        self.0.on_retry(ctx, attempt, error, delay);
        self.1.on_retry(ctx, attempt, error, delay);
    }

    fn on_success(&self, ctx: &ExecutionContext, row_count: usize, duration: Duration) {
        self.0.on_success(ctx, row_count, duration);
        self.1.on_success(ctx, row_count, duration);
    }

    fn on_failure(&self, ctx: &ExecutionContext, error: &QueryError, duration: Duration) {
        self.0.on_failure(ctx, error, duration);
        self.1.on_failure(ctx, error, duration);
    }

    fn on_slow_query(&self, ctx: &ExecutionContext, sql: &str, duration: Duration) {
        self.0.on_slow_query(ctx, sql, duration);
        self.1.on_slow_query(ctx, sql, duration);
    }
}

/// Logs executor events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn on_start(&self, ctx: &ExecutionContext, _sql: &str) {
        debug!(
            correlation_id = %ctx.correlation_id,
            operation = %ctx.operation,
            table = ctx.table.as_deref().unwrap_or("-"),
            "executing query"
        );
    }

    fn on_retry(&self, ctx: &ExecutionContext, attempt: u32, error: &EngineError, delay: Duration) {
        warn!(
            correlation_id = %ctx.correlation_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "query attempt failed, retrying"
        );
    }

    fn on_success(&self, ctx: &ExecutionContext, row_count: usize, duration: Duration) {
        debug!(
            correlation_id = %ctx.correlation_id,
            operation = %ctx.operation,
            rows = row_count,
            duration_ms = duration_ms(duration),
            "query completed"
        );
    }

    fn on_failure(&self, ctx: &ExecutionContext, error: &QueryError, duration: Duration) {
        warn!(
            correlation_id = %ctx.correlation_id,
            operation = %ctx.operation,
            table = ctx.table.as_deref().unwrap_or("-"),
            code = error.code(),
            duration_ms = duration_ms(duration),
            error = %error,
            "query failed"
        );
    }

    fn on_slow_query(&self, ctx: &ExecutionContext, sql: &str, duration: Duration) {
        warn!(
            correlation_id = %ctx.correlation_id,
            duration_ms = duration_ms(duration),
            sql = %sql,
            "slow query"
        );
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// One tracked execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRecord {
    pub query_id: String,
    pub operation: OperationKind,
    pub table: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<f64>,
    /// Only kept when the collector stores statement text.
    pub sql: Option<String>,
    pub row_count: Option<usize>,
    pub error: Option<String>,
    pub retries: u32,
}

impl QueryRecord {
    fn is_complete(&self) -> bool {
        self.duration_ms.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_queries: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub total_retries: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowCountStats {
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TableCounts {
    pub queries: IndexMap<String, u64>,
    pub errors: IndexMap<String, u64>,
}

/// Point-in-time view of a collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub summary: Summary,
    pub operations: IndexMap<OperationKind, u64>,
    pub tables: TableCounts,
    pub durations_ms: Option<DurationStats>,
    pub row_counts: Option<RowCountStats>,
    /// Last failed executions, oldest first.
    pub recent_errors: Vec<QueryRecord>,
    /// Slowest successful executions, slowest first.
    pub slow_queries: Vec<QueryRecord>,
}

/// Filter for [`MetricsCollector::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub table: Option<String>,
    pub operation: Option<OperationKind>,
    pub include_errors: bool,
}

impl HistoryFilter {
    pub fn all() -> Self {
        Self {
            include_errors: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    records: VecDeque<QueryRecord>,
    total_queries: u64,
    total_errors: u64,
    total_retries: u64,
    tables: TableCounts,
    operations: IndexMap<OperationKind, u64>,
}

impl CollectorState {
    fn find(&mut self, query_id: &str) -> Option<&mut QueryRecord> {
        self.records.iter_mut().rev().find(|r| r.query_id == query_id)
    }

    fn reset(&mut self) {
        *self = CollectorState::default();
        for kind in OperationKind::ALL {
            self.operations.insert(kind, 0);
        }
    }
}

/// Bounded in-memory history of executions with aggregate statistics.
#[derive(Debug)]
pub struct MetricsCollector {
    max_history: usize,
    store_sql: bool,
    state: Mutex<CollectorState>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY, false)
    }
}

impl MetricsCollector {
    /// `store_sql` keeps statement text on each record.
    pub fn new(max_history: usize, store_sql: bool) -> Self {
        let mut state = CollectorState::default();
        state.reset();
        Self {
            max_history: max_history.max(1),
            store_sql,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(
        &self,
        ctx: &ExecutionContext,
        duration: Duration,
        rows: Option<usize>,
        error: Option<String>,
    ) {
        let mut state = self.state();
        if error.is_some() {
            state.total_errors += 1;
            if let Some(ref table) = ctx.table {
                *state.tables.errors.entry(table.clone()).or_insert(0) += 1;
            }
        }
        if let Some(record) = state.find(&ctx.correlation_id) {
            record.duration_ms = Some(duration_ms(duration));
            record.row_count = rows;
            record.error = error;
        }
    }

    pub fn stats(&self) -> MetricsSnapshot {
        let state = self.state();
        let completed: Vec<&QueryRecord> = state.records.iter().filter(|r| r.is_complete()).collect();
        let successful: Vec<&QueryRecord> = completed
            .iter()
            .copied()
            .filter(|r| r.error.is_none())
            .collect();

        let mut durations: Vec<f64> = successful.iter().filter_map(|r| r.duration_ms).collect();
        durations.sort_by(f64::total_cmp);
        let durations_ms = duration_stats(&durations);

        let rows: Vec<usize> = successful.iter().filter_map(|r| r.row_count).collect();
        let row_counts = if rows.is_empty() {
            None
        } else {
            let total: usize = rows.iter().sum();
            Some(RowCountStats {
                min: rows.iter().copied().min().unwrap_or(0),
                max: rows.iter().copied().max().unwrap_or(0),
                mean: total as f64 / rows.len() as f64,
                total,
            })
        };

        let errors: Vec<&QueryRecord> = completed
            .iter()
            .copied()
            .filter(|r| r.error.is_some())
            .collect();
        let recent_errors = errors
            .iter()
            .skip(errors.len().saturating_sub(RECENT_LIMIT))
            .map(|r| (*r).clone())
            .collect();

        let mut slow: Vec<&QueryRecord> = successful.clone();
        slow.sort_by(|a, b| {
            b.duration_ms
                .unwrap_or(0.0)
                .total_cmp(&a.duration_ms.unwrap_or(0.0))
        });
        let slow_queries = slow.into_iter().take(RECENT_LIMIT).cloned().collect();

        let error_rate = if state.total_queries > 0 {
            state.total_errors as f64 / state.total_queries as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            summary: Summary {
                total_queries: state.total_queries,
                total_errors: state.total_errors,
                error_rate,
                total_retries: state.total_retries,
            },
            operations: state.operations.clone(),
            tables: state.tables.clone(),
            durations_ms,
            row_counts,
            recent_errors,
            slow_queries,
        }
    }

    /// The last `limit` records, then narrowed by `filter`.
    pub fn history(&self, limit: usize, filter: &HistoryFilter) -> Vec<QueryRecord> {
        let state = self.state();
        let skip = state.records.len().saturating_sub(limit);
        state
            .records
            .iter()
            .skip(skip)
            .filter(|r| filter.table.is_none() || r.table == filter.table)
            .filter(|r| filter.operation.map_or(true, |op| r.operation == op))
            .filter(|r| filter.include_errors || r.error.is_none())
            .cloned()
            .collect()
    }

    pub fn reset(&self) {
        self.state().reset();
    }
}

impl MetricsSink for MetricsCollector {
    fn on_start(&self, ctx: &ExecutionContext, sql: &str) {
        let record = QueryRecord {
            query_id: ctx.correlation_id.clone(),
            operation: ctx.operation,
            table: ctx.table.clone(),
            started_at: Utc::now(),
            duration_ms: None,
            sql: self.store_sql.then(|| sql.to_string()),
            row_count: None,
            error: None,
            retries: 0,
        };

        let mut state = self.state();
        state.total_queries += 1;
        *state.operations.entry(ctx.operation).or_insert(0) += 1;
        if let Some(ref table) = ctx.table {
            *state.tables.queries.entry(table.clone()).or_insert(0) += 1;
        }
        state.records.push_back(record);
        while state.records.len() > self.max_history {
            state.records.pop_front();
        }
    }

    fn on_retry(
        &self,
        ctx: &ExecutionContext,
        _attempt: u32,
        _error: &EngineError,
        _delay: Duration,
    ) {
        let mut state = self.state();
        state.total_retries += 1;
        if let Some(record) = state.find(&ctx.correlation_id) {
            record.retries += 1;
        }
    }

    fn on_success(&self, ctx: &ExecutionContext, row_count: usize, duration: Duration) {
        self.complete(ctx, duration, Some(row_count), None);
    }

    fn on_failure(&self, ctx: &ExecutionContext, error: &QueryError, duration: Duration) {
        self.complete(ctx, duration, None, Some(error.message.clone()));
    }
}

fn duration_stats(sorted: &[f64]) -> Option<DurationStats> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    Some(DurationStats {
        min: sorted[0],
        max: sorted[n - 1],
        mean,
        median,
        p95: quantile(sorted, 19, 20),
        p99: quantile(sorted, 99, 100),
    })
}

/// The `i`-th of `parts - 1` cut points (exclusive method, linear
/// interpolation). `sorted` must be non-empty.
fn quantile(sorted: &[f64], i: usize, parts: usize) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let m = n + 1;
    let j = (i * m / parts).clamp(1, n - 1);
    let delta = (i * m) as f64 - (j * parts) as f64;
    (sorted[j - 1] * (parts as f64 - delta) + sorted[j] * delta) / parts as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(op: OperationKind, table: &str) -> ExecutionContext {
        ExecutionContext::new(op, Some(table))
    }

    #[test]
    fn test_counts_and_history() {
        let collector = MetricsCollector::new(100, true);

        let ok = ctx(OperationKind::List, "users");
        collector.on_start(&ok, "SELECT 1");
        collector.on_success(&ok, 3, Duration::from_millis(20));

        let bad = ctx(OperationKind::Aggregate, "orders");
        collector.on_start(&bad, "SELECT 2");
        collector.on_retry(
            &bad,
            1,
            &EngineError::new(crate::error::EngineErrorKind::Io, "reset"),
            Duration::from_millis(100),
        );
        collector.on_failure(&bad, &QueryError::query("boom"), Duration::from_millis(5));

        let stats = collector.stats();
        assert_eq!(stats.summary.total_queries, 2);
        assert_eq!(stats.summary.total_errors, 1);
        assert_eq!(stats.summary.total_retries, 1);
        assert_eq!(stats.summary.error_rate, 0.5);
        assert_eq!(stats.operations[&OperationKind::List], 1);
        assert_eq!(stats.operations[&OperationKind::Single], 0);
        assert_eq!(stats.tables.errors["orders"], 1);
        assert_eq!(stats.recent_errors.len(), 1);
        assert_eq!(stats.recent_errors[0].retries, 1);
        assert_eq!(stats.row_counts.as_ref().map(|r| r.total), Some(3));

        let history = collector.history(10, &HistoryFilter::all());
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sql.as_deref(), Some("SELECT 1"));

        let no_errors = collector.history(
            10,
            &HistoryFilter {
                include_errors: false,
                ..HistoryFilter::default()
            },
        );
        assert_eq!(no_errors.len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let collector = MetricsCollector::new(2, false);
        for _ in 0..5 {
            let c = ctx(OperationKind::Single, "t");
            collector.on_start(&c, "SELECT 1");
            collector.on_success(&c, 1, Duration::from_millis(1));
        }
        assert_eq!(collector.history(100, &HistoryFilter::all()).len(), 2);
        assert_eq!(collector.stats().summary.total_queries, 5);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::default();
        let c = ctx(OperationKind::Single, "t");
        collector.on_start(&c, "SELECT 1");
        collector.reset();
        let stats = collector.stats();
        assert_eq!(stats.summary.total_queries, 0);
        assert!(stats.durations_ms.is_none());
        assert_eq!(stats.operations.len(), 4);
    }

    #[test]
    fn test_duration_stats() {
        let data: Vec<f64> = (1..=10).map(f64::from).collect();
        let stats = duration_stats(&data).unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 10.0);
        assert_eq!(stats.median, 5.5);
        assert_eq!(stats.mean, 5.5);
        // exclusive method extrapolates past the last point
        assert!((stats.p95 - 10.45).abs() < 1e-9);
        assert_eq!(duration_stats(&[4.0]).unwrap().p99, 4.0);
    }
}
