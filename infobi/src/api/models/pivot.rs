//! Pivot request models.

use super::query::{AggregateFunction, ColumnFilter, SortKey};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use utoipa::ToSchema;

/// How a metric is computed.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    /// `FN(field)`
    Aggregate(AggregateFunction),
    /// Percentage margin `(SUM(revenue) - SUM(cost)) * 100 / SUM(revenue)`, zero when revenue sums to zero.
    ///
    /// Empty fields are completed from the report's available metrics before compilation.
    Margin { revenue_field: String, cost_field: String },
}

/// A computed output column.
///
/// `name` is the output alias and must be unique within a request. A filter keyed by a metric
/// name applies to the aggregated value (HAVING) instead of the raw column (WHERE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MetricWire", into = "MetricWire")]
pub struct MetricDefinition {
    pub name: String,
    pub field: String,
    pub kind: MetricKind,
}

impl MetricDefinition {
    pub fn aggregate(name: impl Into<String>, field: impl Into<String>, function: AggregateFunction) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            kind: MetricKind::Aggregate(function),
        }
    }

    pub fn margin(name: impl Into<String>, revenue_field: impl Into<String>, cost_field: impl Into<String>) -> Self {
        let revenue_field = revenue_field.into();
        Self {
            name: name.into(),
            field: revenue_field.clone(),
            kind: MetricKind::Margin {
                revenue_field,
                cost_field: cost_field.into(),
            },
        }
    }
}

/// Wire shape of a metric: a string-tagged record resolved once into [`MetricDefinition`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricWire {
    pub name: String,
    #[serde(default)]
    pub field: String,
    /// `margin`, or an aggregate name
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    /// Aggregate function (`SUM`, `AVG`, `COUNT`, `MIN`, `MAX`); defaults to `SUM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revenue_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_field: Option<String>,
}

impl TryFrom<MetricWire> for MetricDefinition {
    type Error = ConfigError;

    fn try_from(wire: MetricWire) -> Result<Self, Self::Error> {
        let is_margin = wire
            .metric_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("margin"));

        let kind = if is_margin {
            MetricKind::Margin {
                revenue_field: wire.revenue_field.unwrap_or_else(|| wire.field.clone()),
                cost_field: wire.cost_field.unwrap_or_default(),
            }
        } else {
            let function = match (wire.aggregation.as_deref(), wire.metric_type.as_deref()) {
                (Some(aggregation), _) => aggregation.parse()?,
                // Older clients put the aggregate in `type`; plain value types like "number" mean SUM
                (None, Some(metric_type)) => metric_type.parse().unwrap_or(AggregateFunction::Sum),
                (None, None) => AggregateFunction::Sum,
            };
            MetricKind::Aggregate(function)
        };

        Ok(Self {
            name: wire.name,
            field: wire.field,
            kind,
        })
    }
}

impl From<MetricDefinition> for MetricWire {
    fn from(metric: MetricDefinition) -> Self {
        match metric.kind {
            MetricKind::Aggregate(function) => MetricWire {
                name: metric.name,
                field: metric.field,
                metric_type: None,
                aggregation: Some(function.as_sql().to_string()),
                ..Default::default()
            },
            MetricKind::Margin {
                revenue_field,
                cost_field,
            } => MetricWire {
                name: metric.name,
                field: metric.field,
                metric_type: Some("margin".to_string()),
                aggregation: None,
                revenue_field: Some(revenue_field),
                cost_field: Some(cost_field),
            },
        }
    }
}

/// Request body for `POST /api/pivot/{report_id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PivotRequest {
    /// Grouping columns; their order is the drill hierarchy
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Extra grouping column appended after `group_by`
    #[serde(default)]
    pub split_by: Option<String>,
    #[serde(default)]
    #[schema(value_type = Vec<MetricWire>)]
    pub metrics: Vec<MetricDefinition>,
    #[serde(default)]
    pub filters: BTreeMap<String, ColumnFilter>,
    #[serde(default)]
    pub sort: Option<Vec<SortKey>>,
}

impl PivotRequest {
    /// Grouping columns: `group_by` followed by `split_by`, duplicates dropped, order kept.
    pub fn grouping_columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.group_by
            .iter()
            .chain(self.split_by.iter())
            .filter(|column| seen.insert(column.as_str()))
            .cloned()
            .collect()
    }

    pub fn metric_names(&self) -> HashSet<&str> {
        self.metrics.iter().map(|m| m.name.as_str()).collect()
    }

    /// Reject requests whose metric names collide.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for metric in &self.metrics {
            if !seen.insert(metric.name.as_str()) {
                return Err(ConfigError::DuplicateMetric {
                    name: metric.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, utoipa::IntoParams)]
pub struct RefreshParams {
    /// Bypass the result cache and re-run the query
    #[serde(default)]
    pub force_refresh: bool,
}
