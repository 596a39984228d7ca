//! Report metadata, test-query and cache maintenance payloads.

use super::pivot::{MetricDefinition, MetricWire};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Coarse column type used by pivot configuration UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Number,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Display label, the column name when none is configured
    pub label: String,
}

/// Response of `GET /api/pivot/{report_id}/schema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ReportSchema {
    pub columns: Vec<ColumnInfo>,
    pub default_group_by: Vec<String>,
    #[schema(value_type = Vec<MetricWire>)]
    pub default_metrics: Vec<MetricDefinition>,
    #[schema(value_type = Vec<MetricWire>)]
    pub available_metrics: Vec<MetricDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TestQueryRequest {
    pub connection_id: i64,
    pub query: String,
}

/// Outcome of a test query, run with a 100-row cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TestQueryResponse {
    pub success: bool,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RefreshCacheResponse {
    pub success: bool,
    pub message: String,
    /// Cache entries removed
    pub removed: usize,
}
