/// QuerySpec → parameterized SELECT.
use super::filter::{Filter, FilterCompiler};
use super::params::{ParameterAllocator, ParameterMap};
use super::quote_ident;
use crate::error::{QueryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(s: &str) -> Result<SortDirection> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(SortDirection::Asc),
            "DESC" => Ok(SortDirection::Desc),
            _ => Err(QueryError::validation(format!("Invalid sort direction '{}'", s))
                .with_context("expected_type", "ASC | DESC")
                .with_context("actual_value", s)),
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }

    /// Parse `{"field": "ASC", ...}`, keeping key order as sort priority.
    pub fn list_from_json(json: &serde_json::Value) -> Result<Vec<OrderBy>> {
        let obj = json
            .as_object()
            .ok_or_else(|| QueryError::validation("order_by must be an object"))?;
        obj.iter()
            .map(|(field, dir)| {
                let dir = dir.as_str().ok_or_else(|| {
                    QueryError::validation(format!("Sort direction for '{}' must be a string", field))
                        .with_context("field", field.clone())
                })?;
                Ok(OrderBy {
                    field: field.clone(),
                    direction: SortDirection::parse(dir)?,
                })
            })
            .collect()
    }
}

/// Declarative description of a row query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySpec {
    pub table: String,
    /// Selected columns; empty or `["*"]` selects everything.
    pub columns: Vec<String>,
    pub filter: Option<Filter>,
    /// Sort keys, highest priority first.
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

pub(crate) fn compile_columns(columns: &[String]) -> String {
    if columns.is_empty() {
        return "*".to_string();
    }
    let items: Vec<String> = columns
        .iter()
        .map(|c| {
            if c == "*" {
                c.clone()
            } else {
                quote_ident(c)
            }
        })
        .collect();
    items.join(", ")
}

pub(crate) fn require_table(table: &str) -> Result<()> {
    if table.trim().is_empty() {
        return Err(QueryError::validation("Table name must not be empty")
            .with_context("field", "table"));
    }
    Ok(())
}

/// Compile a [`QuerySpec`] into SQL plus its parameters.
pub fn compile_query(spec: &QuerySpec) -> Result<(String, ParameterMap)> {
    require_table(&spec.table)?;

    let mut params = ParameterAllocator::new();
    let mut parts = Vec::new();

    parts.push(format!("SELECT {}", compile_columns(&spec.columns)));
    parts.push(format!("FROM {}", quote_ident(&spec.table)));

    if let Some(ref filter) = spec.filter {
        if let Some(expr) = FilterCompiler::new(&mut params).compile(filter) {
            parts.push(format!("WHERE {}", expr));
        }
    }

    if !spec.order_by.is_empty() {
        let orders: Vec<String> = spec
            .order_by
            .iter()
            .map(|o| format!("{} {}", quote_ident(&o.field), o.direction.sql()))
            .collect();
        parts.push(format!("ORDER BY {}", orders.join(", ")));
    }

    if let Some(limit) = spec.limit {
        parts.push(format!("LIMIT {}", limit));
    }

    if let Some(offset) = spec.offset {
        parts.push(format!("OFFSET {}", offset));
    }

    Ok((parts.join(" "), params.finish()))
}
