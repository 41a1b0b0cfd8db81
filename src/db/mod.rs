mod connection;
pub mod placeholder;
mod pool;
pub mod postgres;
pub mod replicate;

pub use connection::*;
pub use pool::*;
pub use postgres::{ConnectionConfig, PgConnection, PgConnector, SslMode};
pub use replicate::{ReplicationReport, SkippedTable};
