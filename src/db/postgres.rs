//! PostgreSQL engine on `tokio-postgres`.

use std::error::Error as StdError;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};

use super::connection::{Connection, Connector, PlaceholderStyle, RawResult};
use crate::compiler::aggregate::coerce_temporal;
use crate::error::{categorize_sqlstate, EngineError, EngineErrorKind};
use crate::schema::ScalarKind;
use crate::value::Value;

type BoxError = Box<dyn StdError + Sync + Send>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Only honored for `prefer` and
    /// `require`.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Schema searched by table listing.
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_schema() -> String {
    String::from("public")
}

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl ConnectionConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            self.ssl_mode.as_str()
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            schema: default_schema(),
        }
    }
}

/// Open a client and drive its connection on a background task.
pub async fn create_client(config: &ConnectionConfig) -> Result<Client, EngineError> {
    let conn_string = config.connection_string();

    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| connect_timeout())?
                    .map_err(|e| from_pg_error(&e))?;
            spawn_connection(connection);
            client
        }
        SslMode::Prefer | SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            let strict = matches!(config.ssl_mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)
                .map_err(|e| EngineError::new(EngineErrorKind::Connection, format!("{:#}", e)))?;
            let (client, connection) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| connect_timeout())?
                    .map_err(|e| from_pg_error(&e))?;
            spawn_connection(connection);
            client
        }
    };

    Ok(client)
}

fn connect_timeout() -> EngineError {
    EngineError::new(
        EngineErrorKind::Connection,
        format!("Connection timed out after {}s", CONNECT_TIMEOUT.as_secs()),
    )
}

fn spawn_connection<S, T>(connection: tokio_postgres::Connection<S, T>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "postgres connection closed with error");
        }
    });
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// # Arguments
/// * `config` - Connection configuration
/// * `strict_verify` - If true, always verify certificates (for verify-ca/verify-full modes)
fn build_tls_connector(
    config: &ConnectionConfig,
    strict_verify: bool,
) -> anyhow::Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        let cert = native_tls::Certificate::from_pem(&ca_data)
            .context("Failed to parse CA certificate")?;
        builder.add_root_certificate(cert);
    }

    let connector = builder.build().context("Failed to build TLS connector")?;

    Ok(MakeTlsConnector::new(connector))
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// Map a driver error onto an engine error kind.
pub fn from_pg_error(err: &tokio_postgres::Error) -> EngineError {
    if let Some(db_err) = err.as_db_error() {
        let code = db_err.code().code();
        return EngineError::new(categorize_sqlstate(code), db_err.message()).with_code(code);
    }
    let kind = if err.is_closed() {
        EngineErrorKind::Connection
    } else if err
        .source()
        .map(|s| s.is::<std::io::Error>())
        .unwrap_or(false)
    {
        EngineErrorKind::Io
    } else {
        EngineErrorKind::Connection
    };
    EngineError::new(kind, err.to_string())
}

/// Connects to one PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: ConnectionConfig,
}

impl PgConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self) -> Result<PgConnection, EngineError> {
        debug!(target = %self.config.display_string(), "opening postgres connection");
        let client = create_client(&self.config).await?;
        Ok(PgConnection {
            client,
            schema: self.config.schema.clone(),
        })
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn describe(&self) -> String {
        format!("postgres://{}", self.config.display_string())
    }
}

pub struct PgConnection {
    client: Client,
    schema: String,
}

impl PgConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn as_params(values: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RawResult, EngineError> {
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| from_pg_error(&e))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let rows = self
            .client
            .query(&statement, &as_params(params))
            .await
            .map_err(|e| from_pg_error(&e))?;

        let rows = rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, col)| extract_value(row, i, col.type_()))
                    .collect()
            })
            .collect();

        Ok(RawResult { columns, rows })
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, EngineError> {
        self.client
            .execute(sql, &as_params(params))
            .await
            .map_err(|e| from_pg_error(&e))
    }

    async fn list_tables(&mut self) -> Result<Vec<String>, EngineError> {
        let rows = self
            .client
            .query(
                r#"
                SELECT table_name
                FROM information_schema.tables
                WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                ORDER BY table_name
                "#,
                &[&self.schema],
            )
            .await
            .map_err(|e| from_pg_error(&e))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        if self.client.is_closed() {
            return Err(EngineError::new(
                EngineErrorKind::Connection,
                "connection is closed",
            ));
        }
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| from_pg_error(&e))
    }
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(|v| Value::Int(v.into())),
        Type::INT4 => get::<i32>(row, idx).map(|v| Value::Int(v.into())),
        Type::INT8 => get::<i64>(row, idx).map(Value::Int),
        Type::FLOAT4 => get::<f32>(row, idx).map(|v| Value::Float(v.into())),
        Type::FLOAT8 => get::<f64>(row, idx).map(Value::Float),
        Type::NUMERIC => get::<Decimal>(row, idx).map(|d| Value::Decimal(d.to_string())),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            get::<String>(row, idx).map(Value::Text)
        }
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(Value::Bytes),
        Type::DATE => get::<NaiveDate>(row, idx).map(Value::Date),
        Type::TIME => get::<NaiveTime>(row, idx).map(Value::Time),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx).map(Value::Timestamp),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx).map(Value::TimestampTz),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx).map(Value::Json),
        Type::BOOL_ARRAY => get_list::<bool>(row, idx),
        Type::INT2_ARRAY => get_list::<i16>(row, idx),
        Type::INT4_ARRAY => get_list::<i32>(row, idx),
        Type::INT8_ARRAY => get_list::<i64>(row, idx),
        Type::FLOAT8_ARRAY => get_list::<f64>(row, idx),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get_list::<String>(row, idx),
        // Fallback: try to get as string
        _ => get::<String>(row, idx).map(Value::Text),
    }
    .unwrap_or(Value::Null)
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

fn get_list<'a, T>(row: &'a Row, idx: usize) -> Option<Value>
where
    T: FromSql<'a> + Into<Value>,
{
    get::<Vec<Option<T>>>(row, idx)
        .map(|items| Value::List(items.into_iter().map(Value::from).collect()))
}

/// Parse decimal text the way PostgreSQL accepts it, plain or scientific.
fn parse_decimal(text: &str) -> Result<Decimal, BoxError> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|e| format!("invalid numeric literal {:?}: {}", text, e).into())
}

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn type_error(value: &Value, ty: &Type) -> BoxError {
    format!("cannot bind {} value to parameter of type {}", value.type_name(), ty).into()
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                _ if is_text(ty) => b.to_string().as_str().to_sql(ty, out),
                _ => Err(type_error(self, ty)),
            },
            Value::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::INT8 => i.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*i).to_sql(ty, out),
                _ if is_text(ty) => i.to_string().as_str().to_sql(ty, out),
                _ => Err(type_error(self, ty)),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::FLOAT8 => f.to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                _ if is_text(ty) => f.to_string().as_str().to_sql(ty, out),
                _ => Err(type_error(self, ty)),
            },
            Value::Decimal(s) => match *ty {
                Type::NUMERIC => parse_decimal(s)?.to_sql(ty, out),
                Type::FLOAT4 | Type::FLOAT8 => Value::Float(s.parse()?).to_sql(ty, out),
                Type::INT2 | Type::INT4 | Type::INT8 => Value::Int(s.parse()?).to_sql(ty, out),
                _ => s.as_str().to_sql(ty, out),
            },
            Value::Text(s) => match *ty {
                Type::BOOL => s.parse::<bool>()?.to_sql(ty, out),
                Type::INT2 | Type::INT4 | Type::INT8 => Value::Int(s.trim().parse()?).to_sql(ty, out),
                Type::FLOAT4 | Type::FLOAT8 => Value::Float(s.trim().parse()?).to_sql(ty, out),
                Type::NUMERIC => parse_decimal(s)?.to_sql(ty, out),
                Type::DATE => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?.to_sql(ty, out),
                Type::TIME => s.trim().parse::<NaiveTime>()?.to_sql(ty, out),
                Type::TIMESTAMP | Type::TIMESTAMPTZ => {
                    match coerce_temporal(self.clone(), ScalarKind::Timestamp) {
                        Value::Text(_) => Err(type_error(self, ty)),
                        parsed => parsed.to_sql(ty, out),
                    }
                }
                Type::JSON | Type::JSONB => {
                    serde_json::Value::String(s.clone()).to_sql(ty, out)
                }
                _ => s.as_str().to_sql(ty, out),
            },
            Value::Bytes(b) => b.as_slice().to_sql(ty, out),
            Value::Date(d) => d.to_sql(ty, out),
            Value::Time(t) => t.to_sql(ty, out),
            Value::Timestamp(ts) => match *ty {
                Type::TIMESTAMPTZ => ts.and_utc().to_sql(ty, out),
                _ => ts.to_sql(ty, out),
            },
            Value::TimestampTz(ts) => match *ty {
                Type::TIMESTAMP => ts.naive_utc().to_sql(ty, out),
                _ => ts.to_sql(ty, out),
            },
            Value::Json(j) => match *ty {
                Type::JSON | Type::JSONB => j.to_sql(ty, out),
                _ => j.to_string().as_str().to_sql(ty, out),
            },
            Value::List(items) => match ty.kind() {
                Kind::Array(_) => items.as_slice().to_sql(ty, out),
                _ => Err(type_error(self, ty)),
            },
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(value: &Value, ty: &Type) -> BytesMut {
        let mut buf = BytesMut::new();
        value.to_sql(ty, &mut buf).unwrap();
        buf
    }

    fn numeric(text: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        Decimal::from_str(text)
            .unwrap()
            .to_sql(&Type::NUMERIC, &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_bind_decimal_text_to_numeric() {
        assert_eq!(bound(&Value::Decimal("10000.5".into()), &Type::NUMERIC), numeric("10000.5"));
        assert_eq!(bound(&Value::from(" -0.0012 "), &Type::NUMERIC), numeric("-0.0012"));
        assert_eq!(bound(&Value::Int(42), &Type::NUMERIC), numeric("42"));
    }

    #[test]
    fn test_bind_rejects_bad_numeric() {
        let mut buf = BytesMut::new();
        assert!(Value::Decimal("12a".into()).to_sql(&Type::NUMERIC, &mut buf).is_err());
        assert!(Value::from("ten").to_sql(&Type::NUMERIC, &mut buf).is_err());
        assert!(Value::Decimal("1.5e3".into()).to_sql(&Type::NUMERIC, &mut buf).is_ok());
    }

    #[test]
    fn test_quote_conn_value() {
        assert_eq!(quote_conn_value("simple"), "'simple'");
        assert_eq!(quote_conn_value("it's"), "'it\\'s'");
        assert_eq!(quote_conn_value("back\\slash"), "'back\\\\slash'");
    }

    #[test]
    fn test_connection_string() {
        let config = ConnectionConfig {
            password: "secret".into(),
            ssl_mode: SslMode::VerifyFull,
            ..ConnectionConfig::default()
        };
        let s = config.connection_string();
        assert!(s.contains("host='localhost'"));
        assert!(s.contains("password='secret'"));
        assert!(s.contains("sslmode=verify-full"));
    }

    #[test]
    fn test_bind_int_to_narrow_columns() {
        let mut buf = BytesMut::new();
        assert!(Value::Int(7).to_sql(&Type::INT4, &mut buf).is_ok());
        assert_eq!(&buf[..], &7i32.to_be_bytes());
        let mut buf = BytesMut::new();
        assert!(Value::Int(i64::MAX).to_sql(&Type::INT2, &mut buf).is_err());
    }

    #[test]
    fn test_bind_null() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            Value::Null.to_sql(&Type::INT4, &mut buf),
            Ok(IsNull::Yes)
        ));
    }

    #[test]
    fn test_from_pg_sqlstate() {
        assert_eq!(categorize_sqlstate("42P01"), EngineErrorKind::UndefinedTable);
    }
}
