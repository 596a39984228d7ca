//! Query compilation.
//!
//! Every compiler wraps the report's stored base query as an opaque derived table
//! (`FROM (<base>) AS base_data`) and layers filtering, aggregation, ordering and pagination on
//! top of it. Identifiers are quoted by the [`Dialect`]; literals never appear in the SQL text and
//! travel as bound parameters in [`CompiledQuery::params`].
//!
//! - [`pivot`]: flat GROUP BY aggregation with WHERE/HAVING filter routing
//! - [`grid`]: paginated raw rows plus a total count
//! - [`drill`]: one level of a lazily expanded grouping hierarchy
//! - [`distinct`]: distinct values of a column, for filter pickers

pub mod distinct;
pub mod drill;
pub mod grid;
pub mod pivot;

use crate::api::models::query::{ColumnFilter, FilterOperator, SortKey};
use crate::dialect::Dialect;
use crate::errors::ConfigError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Alias given to the base query when it is used as a derived table.
pub const BASE_ALIAS: &str = "base_data";

/// A statement ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl CompiledQuery {
    /// A statement without parameters, e.g. a stored base query run as-is.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl SqlParam {
    /// Typed parameter from a JSON scalar. Null, arrays and objects are not filterable values.
    pub fn from_json(value: &Value) -> Result<Self, ConfigError> {
        match value {
            Value::String(s) => Ok(SqlParam::Text(s.clone())),
            Value::Bool(b) => Ok(SqlParam::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(SqlParam::Int(i)),
                None => n
                    .as_f64()
                    .map(SqlParam::Float)
                    .ok_or_else(|| ConfigError::invalid(format!("Unsupported numeric value {n}"))),
            },
            Value::Null => Err(ConfigError::invalid("Filter values cannot be null")),
            Value::Array(_) | Value::Object(_) => Err(ConfigError::invalid(format!("Unsupported filter value {value}"))),
        }
    }

    /// Numeric strings become numbers; everything else is left alone.
    fn coerce_numeric(self) -> Self {
        match self {
            SqlParam::Text(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    SqlParam::Int(i)
                } else if let Ok(f) = trimmed.parse::<f64>()
                    && f.is_finite()
                {
                    SqlParam::Float(f)
                } else {
                    SqlParam::Text(s)
                }
            }
            other => other,
        }
    }

    pub(crate) fn as_text(&self) -> String {
        match self {
            SqlParam::Text(s) => s.clone(),
            SqlParam::Int(i) => i.to_string(),
            SqlParam::Float(f) => f.to_string(),
            SqlParam::Bool(b) => b.to_string(),
        }
    }
}

/// Collects bound parameters while a statement is rendered.
pub(crate) struct Binder {
    dialect: Dialect,
    params: Vec<SqlParam>,
}

impl Binder {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    /// Register `param` and return its placeholder.
    pub(crate) fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    pub(crate) fn finish(self, sql: String) -> CompiledQuery {
        CompiledQuery { sql, params: self.params }
    }
}

/// Strip everything but ASCII letters, digits and underscores.
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect()
}

/// Render `column_sql <op> <placeholder>` for one filter.
pub(crate) fn filter_predicate(column_sql: &str, filter: &ColumnFilter, binder: &mut Binder) -> Result<String, ConfigError> {
    let mut value = SqlParam::from_json(&filter.value)?;
    if filter.operator.is_ordering() {
        value = value.coerce_numeric();
    }

    let predicate = match filter.operator {
        FilterOperator::Contains => {
            let placeholder = binder.bind(SqlParam::Text(format!("%{}%", value.as_text())));
            format!("{column_sql} LIKE {placeholder}")
        }
        FilterOperator::NotContains => {
            let placeholder = binder.bind(SqlParam::Text(format!("%{}%", value.as_text())));
            format!("{column_sql} NOT LIKE {placeholder}")
        }
        FilterOperator::StartsWith => {
            let placeholder = binder.bind(SqlParam::Text(format!("{}%", value.as_text())));
            format!("{column_sql} LIKE {placeholder}")
        }
        FilterOperator::EndsWith => {
            let placeholder = binder.bind(SqlParam::Text(format!("%{}", value.as_text())));
            format!("{column_sql} LIKE {placeholder}")
        }
        FilterOperator::Equals => format!("{column_sql} = {}", binder.bind(value)),
        FilterOperator::NotEqual => format!("{column_sql} <> {}", binder.bind(value)),
        FilterOperator::GreaterThan => format!("{column_sql} > {}", binder.bind(value)),
        FilterOperator::GreaterThanOrEqual => format!("{column_sql} >= {}", binder.bind(value)),
        FilterOperator::LessThan => format!("{column_sql} < {}", binder.bind(value)),
        FilterOperator::LessThanOrEqual => format!("{column_sql} <= {}", binder.bind(value)),
    };

    Ok(predicate)
}

/// Predicates for an ag-grid style filter model. Column names are sanitized before quoting and
/// entries whose name sanitizes to nothing are dropped.
pub(crate) fn filter_model_predicates(
    filter_model: &BTreeMap<String, ColumnFilter>,
    dialect: Dialect,
    binder: &mut Binder,
) -> Result<Vec<String>, ConfigError> {
    let mut predicates = Vec::with_capacity(filter_model.len());
    for (column, filter) in filter_model {
        let Some(column_sql) = sanitized_column(column, dialect) else {
            tracing::debug!(column = %column, "Ignoring filter on unusable column name");
            continue;
        };
        predicates.push(filter_predicate(&column_sql, filter, binder)?);
    }
    Ok(predicates)
}

/// ORDER BY items for a sort model, sanitized like [`filter_model_predicates`].
pub(crate) fn sort_model_items(sort_model: &[SortKey], dialect: Dialect) -> Vec<String> {
    sort_model
        .iter()
        .filter_map(|key| sanitized_column(&key.column, dialect).map(|column| format!("{column} {}", key.direction.as_sql())))
        .collect()
}

/// Sanitize then quote a column name; `None` when nothing usable is left.
pub(crate) fn sanitized_column(raw: &str, dialect: Dialect) -> Option<String> {
    let clean = sanitize_identifier(raw);
    (!clean.is_empty()).then(|| dialect.quote_ident(&clean))
}

/// ` WHERE a AND b`, or nothing when there are no predicates.
pub(crate) fn where_clause(predicates: &[String]) -> String {
    if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    }
}

pub(crate) fn derived_table(base_query: &str) -> String {
    format!("({}) AS {BASE_ALIAS}", base_query.trim().trim_end_matches(';'))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Erase everything that legitimately differs between dialects: identifier quotes,
    /// placeholder syntax and pagination.
    pub(crate) fn normalize(sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut chars = sql.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '[' | ']' | '"' | '`' => {}
                '$' if chars.peek().is_some_and(|n| n.is_ascii_digit()) => {
                    while chars.peek().is_some_and(|n| n.is_ascii_digit()) {
                        chars.next();
                    }
                    out.push('?');
                }
                '@' if chars.peek() == Some(&'P') => {
                    chars.next();
                    while chars.peek().is_some_and(|n| n.is_ascii_digit()) {
                        chars.next();
                    }
                    out.push('?');
                }
                _ => out.push(c),
            }
        }
        out
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Region"), "Region");
        assert_eq!(sanitize_identifier("Net Sales"), "NetSales");
        assert_eq!(sanitize_identifier("x]; DROP TABLE t; --"), "xDROPTABLEt");
        assert_eq!(sanitize_identifier("Anno_2024"), "Anno_2024");
        assert_eq!(sanitize_identifier("';--"), "");
    }

    #[test]
    fn test_param_from_json() {
        assert_eq!(SqlParam::from_json(&json!("Eur")).unwrap(), SqlParam::Text("Eur".to_string()));
        assert_eq!(SqlParam::from_json(&json!(42)).unwrap(), SqlParam::Int(42));
        assert_eq!(SqlParam::from_json(&json!(1.5)).unwrap(), SqlParam::Float(1.5));
        assert_eq!(SqlParam::from_json(&json!(true)).unwrap(), SqlParam::Bool(true));
        assert!(SqlParam::from_json(&json!(null)).is_err());
        assert!(SqlParam::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_contains_binds_pattern() {
        let mut binder = Binder::new(Dialect::Postgres);
        let predicate = filter_predicate(
            "\"Region\"",
            &ColumnFilter::new(FilterOperator::Contains, "Eur"),
            &mut binder,
        )
        .unwrap();
        assert_eq!(predicate, "\"Region\" LIKE $1");
        let query = binder.finish(String::new());
        assert_eq!(query.params, vec![SqlParam::Text("%Eur%".to_string())]);
    }

    #[test]
    fn test_ordering_operators_coerce_numeric_strings() {
        let mut binder = Binder::new(Dialect::MsSql);
        let gt = filter_predicate("[Sales]", &ColumnFilter::new(FilterOperator::GreaterThan, "100"), &mut binder).unwrap();
        let lt = filter_predicate("[Sales]", &ColumnFilter::new(FilterOperator::LessThan, "2.5"), &mut binder).unwrap();
        let eq = filter_predicate("[Code]", &ColumnFilter::new(FilterOperator::Equals, "007"), &mut binder).unwrap();
        assert_eq!(gt, "[Sales] > @P1");
        assert_eq!(lt, "[Sales] < @P2");
        assert_eq!(eq, "[Code] = @P3");
        let query = binder.finish(String::new());
        assert_eq!(
            query.params,
            vec![SqlParam::Int(100), SqlParam::Float(2.5), SqlParam::Text("007".to_string())]
        );
    }

    #[test]
    fn test_filter_model_sanitizes_names() {
        let mut filter_model = BTreeMap::new();
        filter_model.insert("Reg ion".to_string(), ColumnFilter::new(FilterOperator::Equals, "EU"));
        filter_model.insert("--".to_string(), ColumnFilter::new(FilterOperator::Equals, "x"));

        let mut binder = Binder::new(Dialect::MySql);
        let predicates = filter_model_predicates(&filter_model, Dialect::MySql, &mut binder).unwrap();
        assert_eq!(predicates, vec!["`Region` = ?"]);
    }

    #[test]
    fn test_derived_table_strips_trailing_semicolon() {
        assert_eq!(derived_table("SELECT * FROM t; "), "(SELECT * FROM t) AS base_data");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("[a] = @P12 AND \"b\" = $3 AND `c` = ?"), "a = ? AND b = ? AND c = ?");
    }
}
