//! Declarative query descriptions → parameterized SQL.
//!
//! Every compilation call owns a fresh [`ParameterAllocator`]; placeholders are
//! emitted as `$p<N>` tokens in first-use order and translated to the engine's
//! native syntax by [`crate::db::placeholder`] right before dispatch.

pub mod aggregate;
pub mod filter;
pub mod params;
pub mod select;

pub use aggregate::{
    AggregateFunction, AggregateRow, AggregateStats, AggregationCompiler, AggregationSpec,
    HavingPredicate, HavingTarget, COUNT_ALIAS,
};
pub use filter::{compile_where, Filter, FilterCompiler, Operator};
pub use params::{ParameterAllocator, ParameterMap};
pub use select::{compile_query, OrderBy, QuerySpec, SortDirection};

use crate::error::Result;
use crate::schema::TableSchema;
use crate::value::Row;

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Compile a grouped aggregation against `schema`.
pub fn compile_aggregation(
    spec: &AggregationSpec,
    schema: &TableSchema,
) -> Result<(String, ParameterMap)> {
    AggregationCompiler::new(schema).compile(spec)
}

/// Reshape flat aggregation rows into per-field statistics.
pub fn reshape_aggregate_rows(
    rows: Vec<Row>,
    spec: &AggregationSpec,
    schema: &TableSchema,
) -> Vec<AggregateRow> {
    AggregationCompiler::new(schema).reshape(rows, spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), r#""users""#);
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn test_compile_where_is_pure() {
        let input = json!({ "a_in": [1, 2], "_or": [{ "b": 1 }, { "c_ne": 2 }] });
        let (sql1, p1) = compile_where(&Filter::from_json(&input).unwrap());
        let (sql2, p2) = compile_where(&Filter::from_json(&input).unwrap());
        assert_eq!(sql1, sql2);
        assert_eq!(p1, p2);
        assert_eq!(p1.len(), 4);
    }
}
