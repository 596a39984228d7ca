//! Server-side row model requests: flat grid pages and lazy drill-down levels.

use super::query::{AggregateFunction, ColumnFilter, SortKey};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// One page of a flat grid, `[startRow, endRow)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GridRequest {
    #[serde(default)]
    pub start_row: u64,
    #[serde(default = "default_end_row")]
    pub end_row: u64,
    #[serde(default)]
    pub sort_model: Vec<SortKey>,
    #[serde(default)]
    pub filter_model: BTreeMap<String, ColumnFilter>,
    /// Accepted for ag-grid compatibility; flat grids ignore it
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub group_keys: Vec<Value>,
}

fn default_end_row() -> u64 {
    100
}

impl GridRequest {
    /// Rows requested by this page.
    pub fn page_size(&self) -> Result<u64, ConfigError> {
        self.end_row.checked_sub(self.start_row).ok_or_else(|| {
            ConfigError::invalid(format!(
                "startRow ({}) must not be greater than endRow ({})",
                self.start_row, self.end_row
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GridResponse {
    #[schema(value_type = Vec<Object>)]
    pub rows: Vec<Map<String, Value>>,
    /// Total number of rows matching the filters
    pub last_row: u64,
}

/// A value column of a drill request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueColumn {
    /// Source column; ag-grid sends it as `field` next to an `id` we ignore
    #[serde(rename = "field", alias = "column")]
    pub column: String,
    #[serde(default = "default_agg_func")]
    pub agg_func: AggregateFunction,
}

fn default_agg_func() -> AggregateFunction {
    AggregateFunction::Sum
}

/// Request for the children of one node of the grouping hierarchy.
///
/// `group_keys` holds the path from the root: one value per already-expanded level of
/// `row_group_cols`. Its length selects the level being fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PivotDrillRequest {
    #[serde(default)]
    pub row_group_cols: Vec<String>,
    #[serde(default)]
    pub value_cols: Vec<ValueColumn>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub group_keys: Vec<Value>,
    #[serde(default)]
    pub filter_model: BTreeMap<String, ColumnFilter>,
    #[serde(default)]
    pub sort_model: Vec<SortKey>,
    #[serde(default)]
    pub pivot_cols: Vec<String>,
    #[serde(default)]
    pub start_row: u64,
    #[serde(default)]
    pub end_row: u64,
}

impl PivotDrillRequest {
    pub fn depth(&self) -> usize {
        self.group_keys.len()
    }

    /// Whether the requested node sits at the deepest grouping level and has no children.
    pub fn is_leaf(&self) -> bool {
        self.depth() == self.row_group_cols.len()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.depth() > self.row_group_cols.len() {
            return Err(ConfigError::DrillDepthExceeded {
                depth: self.depth(),
                levels: self.row_group_cols.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DrillResponse {
    #[schema(value_type = Vec<Object>)]
    pub rows: Vec<Map<String, Value>>,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_size() {
        let request = GridRequest {
            start_row: 100,
            end_row: 150,
            ..Default::default()
        };
        assert_eq!(request.page_size().unwrap(), 50);

        let inverted = GridRequest {
            start_row: 10,
            end_row: 5,
            ..Default::default()
        };
        assert!(inverted.page_size().is_err());
    }

    #[test]
    fn test_grid_request_from_ag_grid() {
        let request: GridRequest = serde_json::from_value(json!({
            "startRow": 0,
            "endRow": 100,
            "sortModel": [{"colId": "Sales", "sort": "desc"}],
            "filterModel": {"Region": {"filterType": "text", "type": "equals", "filter": "Europe"}},
            "groupKeys": []
        }))
        .unwrap();
        assert_eq!(request.sort_model, vec![SortKey::desc("Sales")]);
        assert_eq!(request.filter_model["Region"].value, json!("Europe"));
    }

    #[test]
    fn test_drill_depth() {
        let request: PivotDrillRequest = serde_json::from_value(json!({
            "rowGroupCols": ["Region", "Country"],
            "valueCols": [{"column": "Sales", "aggFunc": "sum"}],
            "groupKeys": ["Europe"]
        }))
        .unwrap();
        assert_eq!(request.depth(), 1);
        assert!(!request.is_leaf());
        assert!(request.validate().is_ok());
        assert_eq!(request.value_cols[0].agg_func, AggregateFunction::Sum);
    }

    #[test]
    fn test_drill_depth_overflow_is_rejected() {
        let request = PivotDrillRequest {
            row_group_cols: vec!["Region".to_string()],
            group_keys: vec![json!("Europe"), json!("Italy")],
            ..Default::default()
        };
        assert_eq!(
            request.validate(),
            Err(ConfigError::DrillDepthExceeded { depth: 2, levels: 1 })
        );
    }
}
