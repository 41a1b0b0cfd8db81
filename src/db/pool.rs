//! Fixed-size connection pool on `deadpool` managed pools.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deadpool::managed::{self, Metrics, Object, PoolError, RecycleError, RecycleResult, Timeouts};
use deadpool::Runtime;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::connection::{Connection, Connector, PlaceholderStyle};
use super::replicate::{self, ReplicationReport, Snapshot};
use crate::error::{EngineError, EngineErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Number of connections, all opened at construction.
    pub size: usize,
    /// Longest wait for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub size: usize,
    pub available: usize,
}

/// Opens connections for the pool and replicates the origin snapshot into
/// in-memory ones.
pub struct PoolManager<C: Connector> {
    connector: C,
    snapshot: Option<Snapshot>,
    report: Mutex<ReplicationReport>,
}

impl<C: Connector> managed::Manager for PoolManager<C> {
    type Type = C::Conn;
    type Error = EngineError;

    async fn create(&self) -> Result<C::Conn, EngineError> {
        let mut conn = self.connector.connect().await?;
        if let Some(ref snapshot) = self.snapshot {
            let report =
                replicate::apply(&mut conn, snapshot, self.connector.placeholder_style()).await;
            self.report
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .merge(report);
        }
        Ok(conn)
    }

    async fn recycle(&self, conn: &mut C::Conn, _: &Metrics) -> RecycleResult<EngineError> {
        conn.ping().await.map_err(RecycleError::Backend)
    }
}

/// Bounded set of live connections.
///
/// Cloning is cheap; clones share the same connections.
pub struct ConnectionPool<C: Connector> {
    pool: managed::Pool<PoolManager<C>>,
    options: PoolOptions,
    closed: Arc<AtomicBool>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options,
            closed: self.closed.clone(),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Open `options.size` connections.
    pub async fn new(connector: C, options: PoolOptions) -> Result<Self, EngineError> {
        Self::build(connector, options, None).await
    }

    /// Open `options.size` connections and, when the connector is in-memory,
    /// copy every table of `origin` into each of them.
    pub async fn with_origin(
        connector: C,
        options: PoolOptions,
        mut origin: C::Conn,
    ) -> Result<Self, EngineError> {
        let snapshot = if connector.is_in_memory() {
            Some(replicate::snapshot(&mut origin).await)
        } else {
            None
        };
        Self::build(connector, options, snapshot).await
    }

    async fn build(
        connector: C,
        options: PoolOptions,
        snapshot: Option<(Snapshot, ReplicationReport)>,
    ) -> Result<Self, EngineError> {
        if options.size == 0 {
            return Err(EngineError::new(
                EngineErrorKind::Other,
                "pool size must be at least 1",
            ));
        }
        let target = connector.describe();
        let (snapshot, report) = match snapshot {
            Some((s, r)) => (Some(s), r),
            None => (None, ReplicationReport::default()),
        };
        let manager = PoolManager {
            connector,
            snapshot,
            report: Mutex::new(report),
        };
        let pool = managed::Pool::builder(manager)
            .max_size(options.size)
            .wait_timeout(Some(options.acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| EngineError::new(EngineErrorKind::Other, e.to_string()))?;

        let this = Self {
            pool,
            options,
            closed: Arc::new(AtomicBool::new(false)),
        };
        this.warm_up().await?;

        let report = this.replication_report();
        if !report.replicated.is_empty()
            || !report.skipped.is_empty()
            || report.origin_error.is_some()
        {
            info!(
                replicated = report.replicated.len(),
                skipped = report.skipped.len(),
                origin_error = report.origin_error.as_deref().unwrap_or("-"),
                "replicated origin tables into pooled connections"
            );
        }
        info!(target = %target, size = options.size, "connection pool ready");
        Ok(this)
    }

    /// Pre-open every connection; any failure is fatal.
    async fn warm_up(&self) -> Result<(), EngineError> {
        let mut held = Vec::with_capacity(self.options.size);
        for _ in 0..self.options.size {
            held.push(self.pool.get().await.map_err(map_pool_error)?);
        }
        debug!(opened = held.len(), "pool warm-up complete");
        Ok(())
    }

    /// Borrow a connection, waiting at most the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, EngineError> {
        self.acquire_timeout(self.options.acquire_timeout).await
    }

    /// Borrow a connection, waiting at most `timeout`.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<C>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::new(
                EngineErrorKind::Connection,
                "connection pool is closed",
            ));
        }
        let timeouts = Timeouts {
            wait: Some(timeout),
            ..self.pool.timeouts()
        };
        self.pool
            .timeout_get(&timeouts)
            .await
            .map(|inner| PooledConnection { inner })
            .map_err(map_pool_error)
    }

    /// Close the pool. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close();
        info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.options.size
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        self.pool.manager().connector.placeholder_style()
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
        }
    }

    /// Tables replicated into (or skipped for) pooled connections.
    pub fn replication_report(&self) -> ReplicationReport {
        self.pool
            .manager()
            .report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn map_pool_error(err: PoolError<EngineError>) -> EngineError {
    match err {
        PoolError::Timeout(_) => EngineError::new(
            EngineErrorKind::PoolExhausted,
            "timed out waiting for a pooled connection",
        ),
        PoolError::Backend(e) => e,
        PoolError::Closed => {
            EngineError::new(EngineErrorKind::Connection, "connection pool is closed")
        }
        other => {
            warn!(error = %other, "unexpected pool error");
            EngineError::new(EngineErrorKind::Other, other.to_string())
        }
    }
}

/// A connection borrowed from the pool. Dropping it returns the connection.
pub struct PooledConnection<C: Connector> {
    inner: Object<PoolManager<C>>,
}

impl<C: Connector> PooledConnection<C> {
    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        &self.inner
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        &mut self.inner
    }
}
