pub mod compiler;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod retry;
pub mod schema;
pub mod value;

pub use compiler::{AggregationSpec, Filter, ParameterMap, QuerySpec};
pub use config::EngineConfig;
pub use error::{EngineError, EngineErrorKind, ErrorKind, QueryError, Result};
pub use executor::{
    BlockingExecutor, ExecutionContext, ExecutorOptions, OperationKind, QueryExecutor,
    QueryOutcome,
};
pub use retry::RetryPolicy;
pub use schema::{ColumnDescriptor, ScalarKind, TableSchema};
pub use value::{Row, Value};
