/// GROUP BY / aggregate / HAVING compilation and result reshaping.
///
/// An aggregation selects the group-by columns, one `<FUNC>("<col>") AS
/// "<col>_<func>"` expression per requested pair and a trailing
/// `COUNT(*) AS "_count"`. The flat rows the engine returns are folded back
/// into per-column statistics by [`AggregationCompiler::reshape`].
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::debug;

use super::filter::{Filter, FilterCompiler, Operator};
use super::params::{ParameterAllocator, ParameterMap};
use super::quote_ident;
use super::select::require_table;
use crate::error::{QueryError, Result};
use crate::schema::{ScalarKind, TableSchema};
use crate::value::{Row, Value};

/// Reserved output name of the per-group row count.
pub const COUNT_ALIAS: &str = "_count";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Sum,
    Avg,
    Min,
    Max,
    Stddev,
    Variance,
}

impl AggregateFunction {
    /// Applied to every numeric column when no functions are requested.
    pub const DEFAULTS: [AggregateFunction; 4] = [
        AggregateFunction::Sum,
        AggregateFunction::Avg,
        AggregateFunction::Min,
        AggregateFunction::Max,
    ];

    pub fn parse(name: &str) -> Option<AggregateFunction> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Some(AggregateFunction::Sum),
            "avg" => Some(AggregateFunction::Avg),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            "stddev" => Some(AggregateFunction::Stddev),
            "variance" => Some(AggregateFunction::Variance),
            _ => None,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Stddev => "STDDEV",
            AggregateFunction::Variance => "VARIANCE",
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Stddev => "stddev",
            AggregateFunction::Variance => "variance",
        }
    }

    /// Output alias of `func(field)`.
    pub fn alias(&self, field: &str) -> String {
        format!("{}_{}", field, self.key())
    }
}

/// What a HAVING predicate compares.
#[derive(Debug, Clone, PartialEq)]
pub enum HavingTarget {
    Count,
    Aggregate {
        field: String,
        func: AggregateFunction,
    },
}

impl HavingTarget {
    fn sql(&self) -> String {
        match self {
            HavingTarget::Count => "COUNT(*)".to_string(),
            HavingTarget::Aggregate { field, func } => {
                format!("{}({})", func.sql(), quote_ident(field))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HavingPredicate {
    pub target: HavingTarget,
    pub op: Operator,
    pub value: Value,
}

impl HavingPredicate {
    pub fn count(op: Operator, value: impl Into<Value>) -> Self {
        Self {
            target: HavingTarget::Count,
            op,
            value: value.into(),
        }
    }

    pub fn aggregate(
        field: impl Into<String>,
        func: AggregateFunction,
        op: Operator,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            target: HavingTarget::Aggregate {
                field: field.into(),
                func,
            },
            op,
            value: value.into(),
        }
    }

    /// Parse a suffix-encoded key: `count_<op>` or `<field>_<func>_<op>`.
    pub fn parse_key(key: &str, value: Value) -> Option<HavingPredicate> {
        let (head, op) = key.rsplit_once('_')?;
        let op = Operator::from_suffix(op).filter(Operator::is_comparison)?;
        if head == "count" {
            return Some(HavingPredicate::count(op, value));
        }
        let (field, func) = head.rsplit_once('_')?;
        if field.is_empty() {
            return None;
        }
        let func = match func {
            "sum" => AggregateFunction::Sum,
            "avg" => AggregateFunction::Avg,
            "min" => AggregateFunction::Min,
            "max" => AggregateFunction::Max,
            _ => return None,
        };
        Some(HavingPredicate::aggregate(field, func, op, value))
    }

    /// Parse a JSON object of suffix-encoded predicates. Keys that do not
    /// parse are skipped.
    pub fn list_from_json(json: &serde_json::Value) -> Result<Vec<HavingPredicate>> {
        let obj = json
            .as_object()
            .ok_or_else(|| QueryError::validation("having must be an object"))?;
        let mut predicates = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            match HavingPredicate::parse_key(key, Value::from(value.clone())) {
                Some(p) => predicates.push(p),
                None => debug!(key = %key, "skipping unrecognized HAVING key"),
            }
        }
        Ok(predicates)
    }
}

/// Declarative description of a grouped aggregation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregationSpec {
    pub table: String,
    pub group_by: Vec<String>,
    /// Requested functions per column. Empty means the defaults for every
    /// numeric column of the table.
    pub functions: IndexMap<String, Vec<AggregateFunction>>,
    pub having: Vec<HavingPredicate>,
    /// Row-level filter applied before grouping.
    pub filter: Option<Filter>,
}

impl AggregationSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn function(mut self, column: impl Into<String>, func: AggregateFunction) -> Self {
        self.functions.entry(column.into()).or_default().push(func);
        self
    }

    pub fn having(mut self, predicate: HavingPredicate) -> Self {
        self.having.push(predicate);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Statistics for one aggregated column. Functions that were not computed
/// stay null.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AggregateStats {
    pub sum: Value,
    pub avg: Value,
    pub min: Value,
    pub max: Value,
    pub stddev: Value,
    pub variance: Value,
}

impl AggregateStats {
    fn set(&mut self, func: AggregateFunction, value: Value) {
        let slot = match func {
            AggregateFunction::Sum => &mut self.sum,
            AggregateFunction::Avg => &mut self.avg,
            AggregateFunction::Min => &mut self.min,
            AggregateFunction::Max => &mut self.max,
            AggregateFunction::Stddev => &mut self.stddev,
            AggregateFunction::Variance => &mut self.variance,
        };
        *slot = value;
    }

    pub fn get(&self, func: AggregateFunction) -> &Value {
        match func {
            AggregateFunction::Sum => &self.sum,
            AggregateFunction::Avg => &self.avg,
            AggregateFunction::Min => &self.min,
            AggregateFunction::Max => &self.max,
            AggregateFunction::Stddev => &self.stddev,
            AggregateFunction::Variance => &self.variance,
        }
    }
}

/// One reshaped aggregation result row.
///
/// Serializes as `{<group columns>..., <field>: {sum, avg, ...}, "_count": n}`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregateRow {
    pub groups: Row,
    pub aggregates: IndexMap<String, AggregateStats>,
    pub count: Value,
}

impl Serialize for AggregateRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = self.groups.len() + self.aggregates.len() + 1;
        let mut map = serializer.serialize_map(Some(len))?;
        for (k, v) in &self.groups {
            map.serialize_entry(k, v)?;
        }
        for (k, v) in &self.aggregates {
            map.serialize_entry(k, v)?;
        }
        map.serialize_entry(COUNT_ALIAS, &self.count)?;
        map.end()
    }
}

/// Compiles aggregation specs against one table's schema.
pub struct AggregationCompiler<'s> {
    schema: &'s TableSchema,
}

impl<'s> AggregationCompiler<'s> {
    pub fn new(schema: &'s TableSchema) -> Self {
        Self { schema }
    }

    /// `(column, function)` pairs selected by `spec`, in output order.
    pub fn aggregate_columns(&self, spec: &AggregationSpec) -> Vec<(String, AggregateFunction)> {
        if spec.functions.values().all(Vec::is_empty) {
            return self
                .schema
                .numeric_columns()
                .flat_map(|c| {
                    AggregateFunction::DEFAULTS
                        .into_iter()
                        .map(move |f| (c.name.clone(), f))
                })
                .collect();
        }
        spec.functions
            .iter()
            .flat_map(|(column, funcs)| funcs.iter().map(move |f| (column.clone(), *f)))
            .collect()
    }

    pub fn compile(&self, spec: &AggregationSpec) -> Result<(String, ParameterMap)> {
        require_table(&spec.table)?;

        let mut params = ParameterAllocator::new();
        let mut selections: Vec<String> = spec.group_by.iter().map(|c| quote_ident(c)).collect();
        for (column, func) in self.aggregate_columns(spec) {
            selections.push(format!(
                "{}({}) AS {}",
                func.sql(),
                quote_ident(&column),
                quote_ident(&func.alias(&column))
            ));
        }
        selections.push(format!("COUNT(*) AS {}", quote_ident(COUNT_ALIAS)));

        let mut parts = vec![
            format!("SELECT {}", selections.join(", ")),
            format!("FROM {}", quote_ident(&spec.table)),
        ];

        if let Some(ref filter) = spec.filter {
            if let Some(expr) = FilterCompiler::new(&mut params).compile(filter) {
                parts.push(format!("WHERE {}", expr));
            }
        }

        if !spec.group_by.is_empty() {
            let groups: Vec<String> = spec.group_by.iter().map(|c| quote_ident(c)).collect();
            parts.push(format!("GROUP BY {}", groups.join(", ")));
        }

        let having: Vec<String> = spec
            .having
            .iter()
            .filter(|h| !h.value.is_null())
            .map(|h| {
                let op = having_operator(h.op);
                let token = params.push(h.value.clone());
                format!("{} {} {}", h.target.sql(), op.sql(), token)
            })
            .collect();
        if !having.is_empty() {
            parts.push(format!("HAVING {}", having.join(" AND ")));
        }

        Ok((parts.join(" "), params.finish()))
    }

    /// Fold flat `<field>_<func>` columns into per-field statistics.
    pub fn reshape(&self, rows: Vec<Row>, spec: &AggregationSpec) -> Vec<AggregateRow> {
        let aliases: IndexMap<String, (String, AggregateFunction)> = self
            .aggregate_columns(spec)
            .into_iter()
            .map(|(column, func)| (func.alias(&column), (column, func)))
            .collect();

        rows.into_iter()
            .map(|row| self.reshape_row(row, spec, &aliases))
            .collect()
    }

    fn reshape_row(
        &self,
        row: Row,
        spec: &AggregationSpec,
        aliases: &IndexMap<String, (String, AggregateFunction)>,
    ) -> AggregateRow {
        let mut out = AggregateRow::default();

        for (key, value) in row {
            if key == COUNT_ALIAS {
                out.count = value;
                continue;
            }
            if spec.group_by.iter().any(|g| *g == key) {
                let value = self.coerce(&key, value);
                out.groups.insert(key, value);
                continue;
            }
            let target = aliases.get(&key).cloned().or_else(|| split_alias(&key));
            match target {
                Some((field, func)) => {
                    let value = match func {
                        AggregateFunction::Min | AggregateFunction::Max => {
                            self.coerce(&field, value)
                        }
                        _ => value,
                    };
                    out.aggregates.entry(field).or_default().set(func, value);
                }
                None => {
                    out.groups.insert(key, value);
                }
            }
        }
        out
    }

    /// Re-parse temporal strings when the schema declares a temporal column.
    fn coerce(&self, column: &str, value: Value) -> Value {
        match self.schema.kind_of(column) {
            Some(kind) if kind.is_temporal() => coerce_temporal(value, kind),
            _ => value,
        }
    }
}

fn split_alias(key: &str) -> Option<(String, AggregateFunction)> {
    let (field, func) = key.rsplit_once('_')?;
    if field.is_empty() {
        return None;
    }
    AggregateFunction::parse(func).map(|f| (field.to_string(), f))
}

fn having_operator(op: Operator) -> Operator {
    match op {
        Operator::NotIn => Operator::Ne,
        Operator::In | Operator::Like | Operator::Ilike => Operator::Eq,
        other => other,
    }
}

/// Parse `value` into the declared temporal kind; strings that do not parse
/// are returned unchanged.
pub fn coerce_temporal(value: Value, kind: ScalarKind) -> Value {
    let parsed = match (&value, kind) {
        (Value::Text(s), ScalarKind::Timestamp) => parse_timestamp(s),
        (Value::Text(s), ScalarKind::Date) => parse_date(s).map(Value::Date),
        _ => None,
    };
    parsed.unwrap_or(value)
}

fn parse_timestamp(s: &str) -> Option<Value> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(Value::TimestampTz(ts.with_timezone(&Utc)));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Value::Timestamp(ts));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(Value::Timestamp)
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    match parse_timestamp(s)? {
        Value::Timestamp(ts) => Some(ts.date()),
        Value::TimestampTz(ts) => Some(ts.date_naive()),
        _ => None,
    }
}
