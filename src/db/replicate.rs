//! Table replication into isolated in-memory connections.
//!
//! Each in-memory connection starts empty, so the pool copies every table of
//! an origin connection into it. Column types are inferred from the first row
//! of each table; tables without rows get all-text columns.

use serde::Serialize;
use tracing::{debug, warn};

use super::connection::{Connection, PlaceholderStyle};
use super::placeholder::bind;
use crate::compiler::{quote_ident, ParameterAllocator, ParameterMap};
use crate::error::{EngineError, EngineErrorKind};
use crate::value::Value;

/// SQL column type chosen for a replicated column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Integer,
    Double,
    Decimal,
    Varchar,
    Array(Box<ColumnType>),
}

impl ColumnType {
    pub fn sql(&self) -> String {
        match self {
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::Double => "DOUBLE".to_string(),
            ColumnType::Decimal => "DECIMAL".to_string(),
            ColumnType::Varchar => "VARCHAR".to_string(),
            ColumnType::Array(inner) => format!("{}[]", inner.sql()),
        }
    }

    /// Infer a column type from one sample value.
    pub fn infer(sample: &Value) -> ColumnType {
        match sample {
            Value::Bool(_) => ColumnType::Boolean,
            Value::Int(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Double,
            Value::Decimal(_) => ColumnType::Decimal,
            Value::List(items) => {
                let inner = items
                    .iter()
                    .find(|v| !v.is_null())
                    .map(ColumnType::infer)
                    .unwrap_or(ColumnType::Varchar);
                ColumnType::Array(Box::new(inner))
            }
            Value::Text(s) if s.trim().parse::<i64>().is_ok() => ColumnType::Integer,
            Value::Text(s) if s.trim().parse::<f64>().is_ok() => ColumnType::Double,
            _ => ColumnType::Varchar,
        }
    }

    /// Convert `value` so it can be inserted into a column of this type.
    pub fn coerce(&self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (ColumnType::Integer, Value::Text(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Text(s),
            },
            (ColumnType::Double, Value::Text(s)) => match s.trim().parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => Value::Text(s),
            },
            (ColumnType::Array(inner), Value::List(items)) => {
                Value::List(items.into_iter().map(|v| inner.coerce(v)).collect())
            }
            (ColumnType::Varchar, value) => match value.normalized() {
                Value::Text(s) => Value::Text(s),
                Value::Decimal(s) => Value::Text(s),
                Value::Bool(b) => Value::Text(b.to_string()),
                Value::Int(i) => Value::Text(i.to_string()),
                Value::Float(f) => Value::Text(f.to_string()),
                other => Value::Text(other.to_json().to_string()),
            },
            (_, value) => value,
        }
    }
}

/// One table read from the origin connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    pub name: String,
    pub columns: Vec<(String, ColumnType)>,
    pub rows: Vec<Vec<Value>>,
}

impl TableSnapshot {
    pub fn new(name: impl Into<String>, columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let columns = match rows.first() {
            Some(first) => columns
                .into_iter()
                .enumerate()
                .map(|(i, c)| {
                    let ty = first.get(i).map(ColumnType::infer).unwrap_or(ColumnType::Varchar);
                    (c, ty)
                })
                .collect(),
            None => columns
                .into_iter()
                .map(|c| (c, ColumnType::Varchar))
                .collect(),
        };
        Self {
            name: name.into(),
            columns,
            rows,
        }
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql()))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            columns.join(", ")
        )
    }

    fn insert_sql(&self) -> (String, usize) {
        let mut params = ParameterAllocator::new();
        let names: Vec<String> = self.columns.iter().map(|(n, _)| quote_ident(n)).collect();
        let tokens: Vec<String> = self
            .columns
            .iter()
            .map(|_| params.push(Value::Null))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.name),
            names.join(", "),
            tokens.join(", ")
        );
        (sql, params.len())
    }
}

/// Tables read from an origin connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub tables: Vec<TableSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTable {
    pub table: String,
    pub reason: String,
}

/// Outcome of replicating a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationReport {
    pub replicated: Vec<String>,
    pub skipped: Vec<SkippedTable>,
    /// Set when the origin's table list could not be read; nothing was
    /// replicated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_error: Option<String>,
}

impl ReplicationReport {
    fn skip(&mut self, table: &str, err: &EngineError) {
        warn!(table = %table, error = %err, "skipping table during replication");
        self.skipped.push(SkippedTable {
            table: table.to_string(),
            reason: err.to_string(),
        });
    }

    /// Fold another report in, keeping each table once.
    pub fn merge(&mut self, other: ReplicationReport) {
        if self.origin_error.is_none() {
            self.origin_error = other.origin_error;
        }
        for table in other.replicated {
            if !self.replicated.contains(&table) && !self.is_skipped(&table) {
                self.replicated.push(table);
            }
        }
        for skipped in other.skipped {
            if !self.is_skipped(&skipped.table) {
                self.replicated.retain(|t| *t != skipped.table);
                self.skipped.push(skipped);
            }
        }
    }

    pub fn is_skipped(&self, table: &str) -> bool {
        self.skipped.iter().any(|s| s.table == table)
    }
}

/// Read every table of `origin`. Tables that cannot be read are skipped; an
/// origin whose tables cannot be listed yields an empty snapshot.
pub async fn snapshot<C: Connection + ?Sized>(origin: &mut C) -> (Snapshot, ReplicationReport) {
    let mut snapshot = Snapshot::default();
    let mut report = ReplicationReport::default();

    let tables = match origin.list_tables().await {
        Ok(tables) => tables,
        Err(e) => {
            warn!(error = %e, "cannot list origin tables, replicating nothing");
            report.origin_error = Some(e.to_string());
            return (snapshot, report);
        }
    };

    for table in tables {
        let sql = format!("SELECT * FROM {}", quote_ident(&table));
        match origin.query(&sql, &[]).await {
            Ok(raw) => {
                debug!(table = %table, rows = raw.row_count(), "snapshotted table");
                snapshot
                    .tables
                    .push(TableSnapshot::new(table, raw.columns, raw.rows));
            }
            Err(e) => report.skip(&table, &e),
        }
    }
    (snapshot, report)
}

/// Create and fill every snapshotted table on `target`.
///
/// A table that fails to create or fill is skipped; replication itself never
/// fails.
pub async fn apply<C: Connection + ?Sized>(
    target: &mut C,
    snapshot: &Snapshot,
    style: PlaceholderStyle,
) -> ReplicationReport {
    let mut report = ReplicationReport::default();
    for table in &snapshot.tables {
        match apply_table(target, table, style).await {
            Ok(()) => report.replicated.push(table.name.clone()),
            Err(e) => report.skip(&table.name, &e),
        }
    }
    report
}

async fn apply_table<C: Connection + ?Sized>(
    target: &mut C,
    table: &TableSnapshot,
    style: PlaceholderStyle,
) -> Result<(), EngineError> {
    target.execute(&table.create_sql(), &[]).await?;
    if table.rows.is_empty() || table.columns.is_empty() {
        return Ok(());
    }

    let (template, count) = table.insert_sql();
    for row in &table.rows {
        let values: Vec<Value> = table
            .columns
            .iter()
            .enumerate()
            .map(|(i, (_, ty))| ty.coerce(row.get(i).cloned().unwrap_or_default()))
            .collect();
        debug_assert_eq!(values.len(), count);
        let params: ParameterMap = values.into_iter().collect();
        let (sql, bound) = bind(&template, &params, style)
            .map_err(|e| EngineError::new(EngineErrorKind::Other, e.message))?;
        target.execute(&sql, &bound).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_types() {
        assert_eq!(ColumnType::infer(&Value::Bool(true)), ColumnType::Boolean);
        assert_eq!(ColumnType::infer(&Value::Int(1)), ColumnType::Integer);
        assert_eq!(ColumnType::infer(&Value::Float(1.5)), ColumnType::Double);
        assert_eq!(ColumnType::infer(&Value::Decimal("1.50".into())), ColumnType::Decimal);
        assert_eq!(ColumnType::infer(&Value::from("42")), ColumnType::Integer);
        assert_eq!(ColumnType::infer(&Value::from("4.2")), ColumnType::Double);
        assert_eq!(ColumnType::infer(&Value::from("abc")), ColumnType::Varchar);
        assert_eq!(ColumnType::infer(&Value::Null), ColumnType::Varchar);
        assert_eq!(
            ColumnType::infer(&Value::from(vec![1i64, 2])).sql(),
            "INTEGER[]"
        );
    }

    #[test]
    fn test_empty_table_is_all_text() {
        let t = TableSnapshot::new("empty", vec!["a".into(), "b".into()], vec![]);
        assert_eq!(t.create_sql(), r#"CREATE TABLE IF NOT EXISTS "empty" ("a" VARCHAR, "b" VARCHAR)"#);
    }

    #[test]
    fn test_first_row_drives_types() {
        let t = TableSnapshot::new(
            "users",
            vec!["id".into(), "name".into(), "score".into()],
            vec![
                vec![Value::Int(1), Value::from("Alice"), Value::Float(9.5)],
                vec![Value::Int(2), Value::Null, Value::Float(7.0)],
            ],
        );
        assert_eq!(
            t.create_sql(),
            r#"CREATE TABLE IF NOT EXISTS "users" ("id" INTEGER, "name" VARCHAR, "score" DOUBLE)"#
        );
        let (insert, count) = t.insert_sql();
        assert_eq!(insert, r#"INSERT INTO "users" ("id", "name", "score") VALUES ($p0, $p1, $p2)"#);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_coerce_for_varchar() {
        assert_eq!(ColumnType::Varchar.coerce(Value::Int(3)), Value::from("3"));
        assert_eq!(ColumnType::Integer.coerce(Value::from("7")), Value::Int(7));
        assert_eq!(ColumnType::Integer.coerce(Value::Null), Value::Null);
    }

    #[test]
    fn test_report_merge_dedupes() {
        let mut a = ReplicationReport {
            replicated: vec!["t1".into(), "t2".into()],
            ..ReplicationReport::default()
        };
        a.merge(ReplicationReport {
            replicated: vec!["t1".into()],
            skipped: vec![SkippedTable {
                table: "t2".into(),
                reason: "boom".into(),
            }],
            ..ReplicationReport::default()
        });
        assert_eq!(a.replicated, vec!["t1".to_string()]);
        assert!(a.is_skipped("t2"));
    }
}
