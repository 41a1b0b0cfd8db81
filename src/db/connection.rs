use async_trait::async_trait;

use crate::error::EngineError;
use crate::value::Value;

/// Native parameter placeholder syntax of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaceholderStyle {
    /// `$1, $2, ...` (PostgreSQL, DuckDB).
    #[default]
    Dollar,
    /// `?` bound positionally (SQLite, MySQL).
    Question,
}

/// Rows as returned by an engine, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RawResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A live engine connection, exclusively owned by one caller at a time.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Run a statement that returns rows. `sql` already uses native
    /// placeholders.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RawResult, EngineError>;

    /// Run a statement and return the affected row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, EngineError>;

    /// User tables visible on this connection.
    async fn list_tables(&mut self) -> Result<Vec<String>, EngineError>;

    /// Cheap liveness check used when recycling pooled connections.
    async fn ping(&mut self) -> Result<(), EngineError>;
}

/// Opens connections to one database.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self) -> Result<Self::Conn, EngineError>;

    /// Whether every connection gets its own isolated in-memory database.
    /// Pools replicate the origin's tables into such connections.
    fn is_in_memory(&self) -> bool {
        false
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}
