//! Building blocks shared by the pivot, grid and drill request models: aggregate functions,
//! column filters and sort keys.

use crate::errors::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

/// Aggregate function applied to a column.
///
/// Parsed case-insensitively from the wire (`"sum"`, `"SUM"`); anything outside this list is
/// rejected so that function names never reach SQL unchecked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[schema(rename_all = "UPPERCASE")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for AggregateFunction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUM" => Ok(AggregateFunction::Sum),
            "AVG" => Ok(AggregateFunction::Avg),
            "COUNT" => Ok(AggregateFunction::Count),
            "MIN" => Ok(AggregateFunction::Min),
            "MAX" => Ok(AggregateFunction::Max),
            _ => Err(ConfigError::invalid(format!("Unsupported aggregate function '{s}'"))),
        }
    }
}

impl Serialize for AggregateFunction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_sql())
    }
}

impl<'de> Deserialize<'de> for AggregateFunction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Comparison applied by a column filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Equals,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl FilterOperator {
    /// Whether the operator compares ordered values, which makes numeric strings worth coercing.
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
        )
    }
}

/// Filter on one column.
///
/// Accepts both the `{type, value}` shape used by pivot requests and the ag-grid
/// `{filterType, type, filter}` shape used by grid and drill requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ColumnFilter {
    #[serde(rename = "type", alias = "operator")]
    pub operator: FilterOperator,
    #[serde(alias = "filter")]
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
    /// ag-grid filter family (`text`, `number`, ...); informational only
    #[serde(rename = "filterType", default, skip_serializing_if = "Option::is_none")]
    pub filter_type: Option<String>,
}

impl ColumnFilter {
    pub fn new(operator: FilterOperator, value: impl Into<serde_json::Value>) -> Self {
        Self {
            operator,
            value: value.into(),
            filter_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum SortDirection {
    #[default]
    #[serde(rename = "asc", alias = "ASC", alias = "Asc")]
    Asc,
    #[serde(rename = "desc", alias = "DESC", alias = "Desc")]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One ORDER BY entry; ag-grid sends `{colId, sort}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SortKey {
    #[serde(alias = "colId", alias = "col")]
    pub column: String,
    #[serde(alias = "sort", default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_aggregate_function_is_case_insensitive() {
        let parsed: Vec<AggregateFunction> = serde_json::from_value(json!(["sum", "AVG", "Count", "min", "MAX"])).unwrap();
        assert_eq!(
            parsed,
            vec![
                AggregateFunction::Sum,
                AggregateFunction::Avg,
                AggregateFunction::Count,
                AggregateFunction::Min,
                AggregateFunction::Max
            ]
        );
    }

    #[test]
    fn test_unknown_aggregate_function_is_rejected() {
        assert!(serde_json::from_value::<AggregateFunction>(json!("SUM); DROP TABLE x; --")).is_err());
        assert!("median".parse::<AggregateFunction>().is_err());
    }

    #[test]
    fn test_filter_accepts_pivot_and_ag_grid_shapes() {
        let pivot: ColumnFilter = serde_json::from_value(json!({"type": "contains", "value": "Eur"})).unwrap();
        assert_eq!(pivot, ColumnFilter::new(FilterOperator::Contains, "Eur"));

        let grid: ColumnFilter =
            serde_json::from_value(json!({"filterType": "number", "type": "greaterThan", "filter": 10})).unwrap();
        assert_eq!(grid.operator, FilterOperator::GreaterThan);
        assert_eq!(grid.value, json!(10));
        assert_eq!(grid.filter_type.as_deref(), Some("number"));
    }

    #[test]
    fn test_unknown_filter_operator_is_rejected() {
        assert!(serde_json::from_value::<ColumnFilter>(json!({"type": "regex", "value": ".*"})).is_err());
    }

    #[test]
    fn test_sort_key_accepts_ag_grid_shape() {
        let key: SortKey = serde_json::from_value(json!({"colId": "Sales", "sort": "desc"})).unwrap();
        assert_eq!(key, SortKey::desc("Sales"));

        let key: SortKey = serde_json::from_value(json!({"column": "Region"})).unwrap();
        assert_eq!(key, SortKey::asc("Region"));
    }
}
