use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Longest SQL snippet carried in error context.
const MAX_SQL_CONTEXT: usize = 200;

pub type Result<T> = std::result::Result<T, QueryError>;

/// Raw failure category reported by an engine or the pool.
///
/// This is the "raw type" the retry policy matches on; classification into the
/// user-facing taxonomy happens afterwards in [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    Connection,
    Io,
    PoolExhausted,
    Timeout,
    Syntax,
    UndefinedTable,
    UndefinedColumn,
    TypeMismatch,
    Constraint,
    Conversion,
    Other,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineErrorKind::Connection => "connection",
            EngineErrorKind::Io => "io",
            EngineErrorKind::PoolExhausted => "pool_exhausted",
            EngineErrorKind::Timeout => "timeout",
            EngineErrorKind::Syntax => "syntax",
            EngineErrorKind::UndefinedTable => "undefined_table",
            EngineErrorKind::UndefinedColumn => "undefined_column",
            EngineErrorKind::TypeMismatch => "type_mismatch",
            EngineErrorKind::Constraint => "constraint",
            EngineErrorKind::Conversion => "conversion",
            EngineErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Unclassified error straight from the engine.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
    /// SQLSTATE, when the engine reports one.
    pub code: Option<String>,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Categorize a SQLSTATE code into an engine error kind.
pub fn categorize_sqlstate(code: &str) -> EngineErrorKind {
    if code.len() < 2 {
        return EngineErrorKind::Other;
    }
    match code {
        "42601" | "42000" => return EngineErrorKind::Syntax,
        "42P01" => return EngineErrorKind::UndefinedTable,
        "42703" => return EngineErrorKind::UndefinedColumn,
        "42804" | "42883" | "22P02" => return EngineErrorKind::TypeMismatch,
        "57014" => return EngineErrorKind::Timeout,
        _ => {}
    }
    match &code[..2] {
        // Class 08: Connection Exception
        "08" => EngineErrorKind::Connection,
        // Class 22: Data Exception
        "22" => EngineErrorKind::Conversion,
        // Class 23: Integrity Constraint Violation
        "23" => EngineErrorKind::Constraint,
        // Class 53: Insufficient Resources, 58: System Error
        "53" | "58" => EngineErrorKind::Io,
        _ => EngineErrorKind::Other,
    }
}

/// User-facing error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing table or column.
    Schema,
    /// Generic execution or syntax failure.
    Query,
    /// Type mismatch in a predicate.
    Filter,
    /// Pool exhaustion or connectivity.
    Connection,
    /// Caller-supplied spec is malformed.
    Validation,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Schema => "SCHEMA_ERROR",
            ErrorKind::Query => "QUERY_ERROR",
            ErrorKind::Filter => "FILTER_ERROR",
            ErrorKind::Connection => "CONNECTION_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Schema => write!(f, "Schema Error"),
            ErrorKind::Query => write!(f, "Query Error"),
            ErrorKind::Filter => write!(f, "Filter Error"),
            ErrorKind::Connection => write!(f, "Connection Error"),
            ErrorKind::Validation => write!(f, "Validation Error"),
        }
    }
}

/// Classified error surfaced to callers.
#[derive(Debug, Clone, Error, Serialize)]
#[error("[{}] {message}", .kind.code())]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: IndexMap<String, String>,
    pub suggestions: Vec<String>,
    pub correlation_id: String,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: IndexMap::new(),
            suggestions: Vec::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Query, message)
    }

    pub fn filter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Filter, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message).with_suggestions([
            "Check that the database server is reachable",
            "Verify the connection settings and credentials",
            "Increase the pool size or acquire timeout if the pool is saturated",
        ])
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach the offending SQL, truncated.
    pub fn with_sql(self, sql: &str) -> Self {
        self.with_context("query", truncate_sql(sql))
    }

    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions = suggestions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Multi-line rendering: message, context, numbered suggestions, correlation id.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("[{}] {}", self.code(), self.message)];

        if !self.context.is_empty() {
            let ctx: Vec<String> = self
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            lines.push(format!("Context: {}", ctx.join(", ")));
        }

        if !self.suggestions.is_empty() {
            lines.push("Suggestions:".to_string());
            for (i, s) in self.suggestions.iter().enumerate() {
                lines.push(format!("  {}. {}", i + 1, s));
            }
        }

        lines.push(format!("Correlation ID: {}", self.correlation_id));
        lines.join("\n")
    }
}

fn truncate_sql(sql: &str) -> String {
    if sql.chars().count() > MAX_SQL_CONTEXT {
        let head: String = sql.chars().take(MAX_SQL_CONTEXT).collect();
        format!("{}...", head)
    } else {
        sql.to_string()
    }
}

fn column_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)column\s*["']?(\w+)["']?(?:\s*(?:in\s*table|of\s*relation)\s*["']?(\w+)["']?)?"#)
            .expect("valid column regex")
    })
}

fn table_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:table\s*(?:with\s*name\s*)?|relation\s*)["']?(\w+)["']?"#)
            .expect("valid table regex")
    })
}

/// Map a raw engine error into the user-facing taxonomy, attaching
/// remediation hints and the original text.
///
/// `table` is the table the failing statement targeted, used when the engine
/// message does not name one.
pub fn classify(err: &EngineError, table: Option<&str>) -> QueryError {
    let msg = err.message.as_str();
    let lower = msg.to_ascii_lowercase();

    let classified = if err.kind == EngineErrorKind::UndefinedColumn
        || msg.contains("Could not find column")
        || (lower.contains("column") && lower.contains("does not exist"))
    {
        let caps = column_pattern().captures(msg);
        let column = caps
            .as_ref()
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let table_name = caps
            .as_ref()
            .and_then(|c| c.get(2))
            .map(|m| m.as_str().to_string())
            .or_else(|| table.map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        QueryError::schema(format!("Column '{}' not found", column))
            .with_context("table", table_name.clone())
            .with_context("column", column)
            .with_suggestions([
                "Check if the column name is spelled correctly".to_string(),
                "List the table's columns to see what is available".to_string(),
                format!("Ensure the column exists in table '{}'", table_name),
            ])
    } else if err.kind == EngineErrorKind::TypeMismatch
        || msg.contains("Cannot compare values of type")
        || msg.contains("Type mismatch")
        || lower.contains("operator does not exist")
    {
        QueryError::filter("Type mismatch in filter condition").with_suggestions([
            "Ensure you're comparing compatible types (numbers with numbers, strings with strings)",
            "Use proper quotes for string values",
            "Check if numeric fields are being compared with string values",
        ])
    } else if err.kind == EngineErrorKind::Syntax
        || msg.contains("Parser Error")
        || lower.contains("syntax error")
    {
        QueryError::query("SQL syntax error in generated query").with_suggestions([
            "This might be a bug in SQL generation",
            "Try simplifying the query",
            "Report this issue with the query and table definition",
        ])
    } else if matches!(
        err.kind,
        EngineErrorKind::Connection
            | EngineErrorKind::Io
            | EngineErrorKind::PoolExhausted
            | EngineErrorKind::Timeout
    ) {
        QueryError::connection("Database connection failed")
    } else if err.kind == EngineErrorKind::UndefinedTable
        || msg.contains("Catalog Error")
        || (lower.contains("relation") && lower.contains("does not exist"))
    {
        let table_name = table_pattern()
            .captures(msg)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .or_else(|| table.map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        QueryError::schema(format!("Table '{}' not found", table_name))
            .with_context("table", table_name)
            .with_suggestions([
                "Check if the table name is spelled correctly",
                "List the database's tables to see what is available",
                "Ensure the table has been created in the database",
            ])
    } else {
        QueryError::query(format!("Database error: {}", err.message))
            .with_context("error_type", err.kind.to_string())
    };

    let classified = classified.with_context("original_error", msg);
    match &err.code {
        Some(code) => classified.with_context("sqlstate", code.clone()),
        None => classified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), EngineErrorKind::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), EngineErrorKind::UndefinedTable);
        assert_eq!(categorize_sqlstate("42703"), EngineErrorKind::UndefinedColumn);
        assert_eq!(categorize_sqlstate("42883"), EngineErrorKind::TypeMismatch);
        assert_eq!(categorize_sqlstate("23505"), EngineErrorKind::Constraint);
        assert_eq!(categorize_sqlstate("22012"), EngineErrorKind::Conversion);
        assert_eq!(categorize_sqlstate("08006"), EngineErrorKind::Connection);
        assert_eq!(categorize_sqlstate("XX000"), EngineErrorKind::Other);
        assert_eq!(categorize_sqlstate(""), EngineErrorKind::Other);
    }

    #[test]
    fn test_classify_missing_column() {
        let raw = EngineError::new(
            EngineErrorKind::Other,
            "Binder Error: Could not find column 'username' in table 'users'",
        );
        let err = classify(&raw, None);
        assert_eq!(err.kind, ErrorKind::Schema);
        assert_eq!(err.message, "Column 'username' not found");
        assert_eq!(err.context["column"], "username");
        assert_eq!(err.context["table"], "users");
        assert!(err.context["original_error"].contains("Could not find column"));
        assert_eq!(err.suggestions.len(), 3);
    }

    #[test]
    fn test_classify_postgres_missing_column_uses_target_table() {
        let raw = EngineError::new(
            EngineErrorKind::UndefinedColumn,
            "column \"agee\" does not exist",
        )
        .with_code("42703");
        let err = classify(&raw, Some("people"));
        assert_eq!(err.kind, ErrorKind::Schema);
        assert_eq!(err.context["column"], "agee");
        assert_eq!(err.context["table"], "people");
        assert_eq!(err.context["sqlstate"], "42703");
    }

    #[test]
    fn test_classify_type_mismatch() {
        let raw = EngineError::new(
            EngineErrorKind::Other,
            "Cannot compare values of type VARCHAR and type INTEGER",
        );
        assert_eq!(classify(&raw, None).kind, ErrorKind::Filter);
    }

    #[test]
    fn test_classify_syntax() {
        let raw = EngineError::new(EngineErrorKind::Other, "Parser Error: syntax error at or near \"FROM\"");
        let err = classify(&raw, None);
        assert_eq!(err.kind, ErrorKind::Query);
        assert_eq!(err.message, "SQL syntax error in generated query");
    }

    #[test]
    fn test_classify_connection() {
        let raw = EngineError::new(EngineErrorKind::Io, "broken pipe");
        let err = classify(&raw, None);
        assert_eq!(err.kind, ErrorKind::Connection);
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(!err.suggestions.is_empty());
    }

    #[test]
    fn test_classify_missing_table() {
        let raw = EngineError::new(
            EngineErrorKind::Other,
            "Catalog Error: Table with name products does not exist!",
        );
        let err = classify(&raw, None);
        assert_eq!(err.kind, ErrorKind::Schema);
        assert_eq!(err.message, "Table 'products' not found");

        let raw = EngineError::new(
            EngineErrorKind::UndefinedTable,
            "relation \"orders\" does not exist",
        );
        assert_eq!(classify(&raw, None).context["table"], "orders");
    }

    #[test]
    fn test_classify_generic_keeps_raw_text_out_of_kind() {
        let raw = EngineError::new(EngineErrorKind::Constraint, "duplicate key value");
        let err = classify(&raw, None);
        assert_eq!(err.kind, ErrorKind::Query);
        assert_eq!(err.context["error_type"], "constraint");
        assert_eq!(err.context["original_error"], "duplicate key value");
    }

    #[test]
    fn test_sql_context_is_truncated() {
        let sql = "x".repeat(250);
        let err = QueryError::query("boom").with_sql(&sql);
        assert_eq!(err.context["query"].len(), MAX_SQL_CONTEXT + 3);
        assert!(err.context["query"].ends_with("..."));
    }

    #[test]
    fn test_display_full() {
        let err = QueryError::schema("Table 'x' not found")
            .with_context("table", "x")
            .with_suggestions(["Check spelling"])
            .with_correlation_id("abc-123");
        let full = err.display_full();
        assert!(full.starts_with("[SCHEMA_ERROR] Table 'x' not found"));
        assert!(full.contains("Context: table=x"));
        assert!(full.contains("  1. Check spelling"));
        assert!(full.contains("Correlation ID: abc-123"));
        assert_eq!(err.to_string(), "[SCHEMA_ERROR] Table 'x' not found");
    }
}
