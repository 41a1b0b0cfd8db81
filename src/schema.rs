//! Static table descriptions supplied by the schema layer.
//!
//! The compilers never introspect the database themselves: whoever builds the
//! query surface hands over one `TableSchema` per table, and the aggregation
//! compiler reads numeric classification and temporal coercion hints from it.

use serde::{Deserialize, Serialize};

/// Scalar kind of a column, as far as query compilation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    Boolean,
    Integer,
    Float,
    Decimal,
    Text,
    Date,
    Timestamp,
    Time,
    Bytes,
    Json,
    List,
}

impl ScalarKind {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarKind::Integer | ScalarKind::Float | ScalarKind::Decimal
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, ScalarKind::Date | ScalarKind::Timestamp)
    }

    /// Classify an engine type name (PostgreSQL or DuckDB spelling).
    pub fn from_type_name(type_name: &str) -> ScalarKind {
        let t = type_name.trim().to_ascii_uppercase();
        if t.ends_with("[]") {
            return ScalarKind::List;
        }
        match t.as_str() {
            "BOOL" | "BOOLEAN" => ScalarKind::Boolean,
            "INT" | "INT2" | "INT4" | "INT8" | "SMALLINT" | "INTEGER" | "BIGINT" | "HUGEINT"
            | "TINYINT" | "UBIGINT" | "UINTEGER" => ScalarKind::Integer,
            "FLOAT" | "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" => {
                ScalarKind::Float
            }
            "DATE" => ScalarKind::Date,
            "TIME" | "TIME WITHOUT TIME ZONE" => ScalarKind::Time,
            "BYTEA" | "BLOB" => ScalarKind::Bytes,
            "JSON" | "JSONB" => ScalarKind::Json,
            _ if t.starts_with("DECIMAL") || t.starts_with("NUMERIC") => ScalarKind::Decimal,
            _ if t.starts_with("TIMESTAMP") => ScalarKind::Timestamp,
            _ => ScalarKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: ScalarKind,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered column list for one table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.columns.push(ColumnDescriptor::new(name, kind));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn kind_of(&self, name: &str) -> Option<ScalarKind> {
        self.get(name).map(|c| c.kind)
    }

    pub fn numeric_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.kind.is_numeric())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_type_name() {
        assert_eq!(ScalarKind::from_type_name("integer"), ScalarKind::Integer);
        assert_eq!(ScalarKind::from_type_name("DECIMAL(10,2)"), ScalarKind::Decimal);
        assert_eq!(
            ScalarKind::from_type_name("timestamp with time zone"),
            ScalarKind::Timestamp
        );
        assert_eq!(ScalarKind::from_type_name("VARCHAR[]"), ScalarKind::List);
        assert_eq!(ScalarKind::from_type_name("varchar"), ScalarKind::Text);
    }

    #[test]
    fn test_numeric_columns() {
        let schema = TableSchema::new("sales")
            .column("region", ScalarKind::Text)
            .column("revenue", ScalarKind::Decimal)
            .column("units", ScalarKind::Integer)
            .column("sold_at", ScalarKind::Timestamp);
        let names: Vec<&str> = schema.numeric_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["revenue", "units"]);
        assert_eq!(schema.kind_of("sold_at"), Some(ScalarKind::Timestamp));
        assert!(schema.get("missing").is_none());
    }
}
