/// Boolean filter trees and their translation into SQL predicates.
///
/// Filters arrive either as a structured [`Filter`] tree or through the
/// suffix-encoded JSON form (`{"age_gte": 18, "_or": [...]}`) handled by
/// [`Filter::from_json`]. Compilation is total: operator/value combinations
/// that make no sense degrade to the nearest sensible comparison instead of
/// failing, and null-valued leaves are dropped.
use super::params::{ParameterAllocator, ParameterMap};
use super::quote_ident;
use crate::error::{QueryError, Result};
use crate::value::Value;

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    In,
    NotIn,
}

impl Operator {
    /// Parse a single-token key suffix. `not_in` spans two tokens and is
    /// handled by [`split_operator`].
    pub fn from_suffix(suffix: &str) -> Option<Operator> {
        match suffix {
            "eq" => Some(Operator::Eq),
            "ne" => Some(Operator::Ne),
            "gt" => Some(Operator::Gt),
            "gte" => Some(Operator::Gte),
            "lt" => Some(Operator::Lt),
            "lte" => Some(Operator::Lte),
            "like" => Some(Operator::Like),
            "ilike" => Some(Operator::Ilike),
            "in" => Some(Operator::In),
            _ => None,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Like => "like",
            Operator::Ilike => "ilike",
            Operator::In => "in",
            Operator::NotIn => "not_in",
        }
    }

    /// Plain ordered/equality comparison (usable in HAVING).
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Operator::Eq | Operator::Ne | Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte
        )
    }

    /// SQL spelling for scalar comparisons.
    pub fn sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Like => "LIKE",
            Operator::Ilike => "ILIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
        }
    }
}

/// Split a suffix-encoded key into `(field, operator)`.
///
/// `not_in` is checked before single-token suffixes. Keys without a known
/// suffix, or whose suffix would leave an empty field, are plain equality on
/// the whole key.
pub fn split_operator(key: &str) -> (&str, Operator) {
    if let Some(rest) = key.strip_suffix("not_in") {
        match rest.strip_suffix('_') {
            Some(field) if !field.is_empty() => return (field, Operator::NotIn),
            _ if rest.is_empty() || rest == "_" => return (key, Operator::Eq),
            _ => {}
        }
    }
    if let Some((field, suffix)) = key.rsplit_once('_') {
        if !field.is_empty() {
            if let Some(op) = Operator::from_suffix(suffix) {
                return (field, op);
            }
        }
    }
    (key, Operator::Eq)
}

/// Boolean filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field <op> value`
    Compare {
        field: String,
        op: Operator,
        value: Value,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// Sibling terms conjoined without extra parentheses (one JSON object).
    All(Vec<Filter>),
}

impl Filter {
    pub fn compare(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Filter::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Operator::Eq, value)
    }

    pub fn not(inner: Filter) -> Self {
        Filter::Not(Box::new(inner))
    }

    /// Parse the suffix-encoded JSON form.
    ///
    /// Object keys are either combinators (`_and`, `_or`, `_not`, or their
    /// upper-case `AND`/`OR`/`NOT` spellings) or `<field>_<op>` leaves.
    pub fn from_json(json: &serde_json::Value) -> Result<Filter> {
        let obj = json.as_object().ok_or_else(|| {
            QueryError::validation("Filter must be an object")
                .with_context("actual_type", json_type(json))
        })?;

        let mut terms = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            let term = match key.as_str() {
                "_and" | "AND" => Filter::And(parse_list(key, value)?),
                "_or" | "OR" => Filter::Or(parse_list(key, value)?),
                "_not" | "NOT" => Filter::not(Filter::from_json(value)?),
                _ => {
                    let (field, op) = split_operator(key);
                    Filter::compare(field, op, Value::from(value.clone()))
                }
            };
            terms.push(term);
        }
        Ok(Filter::All(terms))
    }

    /// Number of leaves that will produce a condition (non-null values).
    pub fn leaf_count(&self) -> usize {
        match self {
            Filter::Compare { value, .. } => usize::from(!value.is_null()),
            Filter::Not(inner) => inner.leaf_count(),
            Filter::And(children) | Filter::Or(children) | Filter::All(children) => {
                children.iter().map(Filter::leaf_count).sum()
            }
        }
    }
}

fn parse_list(key: &str, value: &serde_json::Value) -> Result<Vec<Filter>> {
    let items = value.as_array().ok_or_else(|| {
        QueryError::validation(format!("'{}' expects a list of filters", key))
            .with_context("field", key)
            .with_context("actual_type", json_type(value))
    })?;
    items.iter().map(Filter::from_json).collect()
}

fn json_type(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Compiles filter trees into SQL boolean expressions, binding values through
/// a caller-owned allocator so WHERE and HAVING clauses can share numbering.
pub struct FilterCompiler<'a> {
    params: &'a mut ParameterAllocator,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(params: &'a mut ParameterAllocator) -> Self {
        Self { params }
    }

    /// Compile to a single expression, or `None` when no condition survives.
    pub fn compile(&mut self, filter: &Filter) -> Option<String> {
        let conditions = self.conditions(filter);
        if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        }
    }

    /// Top-level conditions of `filter`, meant to be joined with `AND`.
    pub fn conditions(&mut self, filter: &Filter) -> Vec<String> {
        match filter {
            Filter::Compare { field, op, value } => {
                self.compile_leaf(field, *op, value).into_iter().collect()
            }
            Filter::All(children) => children
                .iter()
                .flat_map(|child| self.conditions(child))
                .collect(),
            Filter::And(children) => self.combine(children, " AND "),
            Filter::Or(children) => self.combine(children, " OR "),
            Filter::Not(inner) => {
                let conditions = self.conditions(inner);
                if conditions.is_empty() {
                    vec![]
                } else {
                    vec![format!("NOT ({})", conditions.join(" AND "))]
                }
            }
        }
    }

    fn combine(&mut self, children: &[Filter], joiner: &str) -> Vec<String> {
        let parts: Vec<String> = children
            .iter()
            .filter_map(|child| {
                let conditions = self.conditions(child);
                if conditions.is_empty() {
                    None
                } else {
                    Some(format!("({})", conditions.join(" AND ")))
                }
            })
            .collect();

        if parts.is_empty() {
            vec![]
        } else {
            vec![format!("({})", parts.join(joiner))]
        }
    }

    fn compile_leaf(&mut self, field: &str, op: Operator, value: &Value) -> Option<String> {
        if value.is_null() {
            return None;
        }
        let column = quote_ident(field);

        let op = match (op, value.as_list()) {
            (Operator::In | Operator::NotIn, Some(items)) => {
                return Some(self.compile_list(&column, op, items));
            }
            // A scalar under `in`/`not_in` is plain (in)equality.
            (Operator::In, None) => Operator::Eq,
            (Operator::NotIn, None) => Operator::Ne,
            (op, _) => op,
        };

        let token = self.params.push(value.clone());
        Some(format!("{} {} {}", column, op.sql(), token))
    }

    fn compile_list(&mut self, column: &str, op: Operator, items: &[Value]) -> String {
        if items.is_empty() {
            // Nothing is IN an empty set; everything is NOT IN it.
            return match op {
                Operator::NotIn => "TRUE".to_string(),
                _ => "FALSE".to_string(),
            };
        }
        let tokens: Vec<String> = items
            .iter()
            .map(|item| self.params.push(item.clone()))
            .collect();
        format!("{} {} ({})", column, op.sql(), tokens.join(", "))
    }
}

/// Compile a filter into a standalone WHERE expression (without the keyword).
///
/// The expression is empty when every leaf was dropped.
pub fn compile_where(filter: &Filter) -> (String, ParameterMap) {
    let mut params = ParameterAllocator::new();
    let sql = FilterCompiler::new(&mut params)
        .compile(filter)
        .unwrap_or_default();
    (sql, params.finish())
}
