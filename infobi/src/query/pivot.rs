//! Pivot compilation: a flat `GROUP BY` over the base query.
//!
//! Filters keyed by a metric name are applied after aggregation (HAVING) on the metric's
//! aggregate expression; every other filter is applied to the raw column (WHERE). The margin
//! metric is guarded so that a zero revenue sum yields `0` instead of a division error.

use super::{Binder, CompiledQuery, derived_table, filter_predicate, where_clause};
use crate::api::models::pivot::{MetricDefinition, MetricKind, PivotRequest};
use crate::dialect::Dialect;
use crate::errors::ConfigError;

/// Compile `request` against `base_query`.
///
/// Grouping uses [`PivotRequest::grouping_columns`]. With no grouping columns and no metrics the
/// base query is returned unchanged.
pub fn compile_pivot(base_query: &str, request: &PivotRequest, dialect: Dialect) -> Result<CompiledQuery, ConfigError> {
    request.validate()?;

    let group_by = request.grouping_columns();
    if group_by.is_empty() && request.metrics.is_empty() {
        return Ok(CompiledQuery::raw(base_query));
    }

    let quoted_groups: Vec<String> = group_by.iter().map(|c| dialect.quote_ident(c)).collect();

    let mut select_items = quoted_groups.clone();
    for metric in &request.metrics {
        match metric_expression(metric, dialect) {
            Some(expression) => select_items.push(format!("{expression} AS {}", dialect.quote_ident(&metric.name))),
            None => tracing::debug!(metric = %metric.name, "Skipping metric without a source field"),
        }
    }
    if select_items.is_empty() {
        select_items.push("*".to_string());
    }

    let mut binder = Binder::new(dialect);
    let mut where_predicates = Vec::new();
    let mut having_predicates = Vec::new();
    for (key, filter) in &request.filters {
        match request.metrics.iter().find(|m| &m.name == key) {
            Some(metric) => {
                // Aliases are not visible to HAVING on every backend, so repeat the aggregate
                let Some(expression) = metric_expression(metric, dialect) else {
                    continue;
                };
                having_predicates.push(filter_predicate(&expression, filter, &mut binder)?);
            }
            None => where_predicates.push(filter_predicate(&dialect.quote_ident(key), filter, &mut binder)?),
        }
    }

    let mut sql = format!("SELECT {} FROM {}", select_items.join(", "), derived_table(base_query));
    sql.push_str(&where_clause(&where_predicates));
    if !quoted_groups.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", quoted_groups.join(", ")));
    }
    if !having_predicates.is_empty() {
        sql.push_str(&format!(" HAVING {}", having_predicates.join(" AND ")));
    }

    let order_items: Vec<String> = match request.sort.as_deref() {
        Some(sort) if !sort.is_empty() => sort
            .iter()
            .map(|key| format!("{} {}", dialect.quote_ident(&key.column), key.direction.as_sql()))
            .collect(),
        _ => quoted_groups.iter().map(|column| format!("{column} ASC")).collect(),
    };
    if !order_items.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order_items.join(", ")));
    }

    Ok(binder.finish(sql))
}

/// Aggregate expression for a metric, `None` when the metric lacks the fields it needs.
fn metric_expression(metric: &MetricDefinition, dialect: Dialect) -> Option<String> {
    match &metric.kind {
        MetricKind::Aggregate(function) => {
            if metric.field.is_empty() {
                return None;
            }
            Some(format!("{}({})", function.as_sql(), dialect.quote_ident(&metric.field)))
        }
        MetricKind::Margin {
            revenue_field,
            cost_field,
        } => {
            if revenue_field.is_empty() || cost_field.is_empty() {
                return None;
            }
            let revenue = format!("SUM({})", dialect.quote_ident(revenue_field));
            let cost = format!("SUM({})", dialect.quote_ident(cost_field));
            // ROUND(numeric, int) is the only two-argument form Postgres accepts
            Some(format!(
                "CASE WHEN {revenue} = 0 THEN 0 ELSE ROUND(CAST(({revenue} - {cost}) * 100.0 / {revenue} AS DECIMAL(38,4)), 2) END"
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::query::{AggregateFunction, ColumnFilter, FilterOperator, SortKey};
    use crate::query::SqlParam;
    use crate::query::tests::normalize;
    use std::collections::BTreeMap;

    const BASE: &str = "SELECT Region, Country, Venduto, Costo, Sales FROM sales_facts";

    fn filters(entries: &[(&str, ColumnFilter)]) -> BTreeMap<String, ColumnFilter> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_identity_passthrough() {
        let compiled = compile_pivot(BASE, &PivotRequest::default(), Dialect::MsSql).unwrap();
        assert_eq!(compiled, CompiledQuery::raw(BASE));
    }

    #[test]
    fn test_end_to_end_margin_example() {
        let request = PivotRequest {
            group_by: vec!["Region".to_string()],
            metrics: vec![MetricDefinition::margin("MarginePerc", "Venduto", "Costo")],
            filters: filters(&[("Region", ColumnFilter::new(FilterOperator::Contains, "Eur"))]),
            ..Default::default()
        };

        let compiled = compile_pivot(BASE, &request, Dialect::MsSql).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT [Region], CASE WHEN SUM([Venduto]) = 0 THEN 0 ELSE ROUND(CAST((SUM([Venduto]) - SUM([Costo])) * 100.0 / SUM([Venduto]) AS DECIMAL(38,4)), 2) END AS [MarginePerc] \
             FROM (SELECT Region, Country, Venduto, Costo, Sales FROM sales_facts) AS base_data \
             WHERE [Region] LIKE @P1 GROUP BY [Region] ORDER BY [Region] ASC"
        );
        assert_eq!(compiled.params, vec![SqlParam::Text("%Eur%".to_string())]);
    }

    #[test]
    fn test_margin_guard_present_for_every_dialect() {
        let request = PivotRequest {
            metrics: vec![MetricDefinition::margin("Margin", "Venduto", "Costo")],
            ..Default::default()
        };
        for dialect in [Dialect::MsSql, Dialect::Postgres, Dialect::MySql] {
            let sql = compile_pivot(BASE, &request, dialect).unwrap().sql;
            assert!(
                normalize(&sql).contains("CASE WHEN SUM(Venduto) = 0 THEN 0 ELSE"),
                "missing zero guard for {dialect}: {sql}"
            );
        }
    }

    #[test]
    fn test_filter_routing_where_vs_having() {
        let request = PivotRequest {
            group_by: vec!["Region".to_string()],
            metrics: vec![MetricDefinition::aggregate("Sales", "Sales", AggregateFunction::Sum)],
            filters: filters(&[
                ("Sales", ColumnFilter::new(FilterOperator::GreaterThan, 1000)),
                ("Country", ColumnFilter::new(FilterOperator::Equals, "Italy")),
            ]),
            ..Default::default()
        };

        let compiled = compile_pivot(BASE, &request, Dialect::Postgres).unwrap();
        // BTreeMap ordering: Country is bound before Sales
        assert!(compiled.sql.contains(" WHERE \"Country\" = $1 GROUP BY"), "{}", compiled.sql);
        assert!(compiled.sql.contains(" HAVING SUM(\"Sales\") > $2"), "{}", compiled.sql);
        assert!(!compiled.sql.contains("WHERE \"Sales\""));
        assert_eq!(compiled.params, vec![SqlParam::Text("Italy".to_string()), SqlParam::Int(1000)]);
    }

    #[test]
    fn test_metrics_without_field_are_skipped() {
        let request = PivotRequest {
            group_by: vec!["Region".to_string()],
            metrics: vec![
                MetricDefinition::aggregate("Empty", "", AggregateFunction::Sum),
                MetricDefinition::margin("NoCost", "Venduto", ""),
                MetricDefinition::aggregate("Rows", "Sales", AggregateFunction::Count),
            ],
            ..Default::default()
        };
        let sql = compile_pivot(BASE, &request, Dialect::MySql).unwrap().sql;
        assert_eq!(
            sql,
            "SELECT `Region`, COUNT(`Sales`) AS `Rows` FROM (SELECT Region, Country, Venduto, Costo, Sales FROM sales_facts) AS base_data \
             GROUP BY `Region` ORDER BY `Region` ASC"
        );
    }

    #[test]
    fn test_explicit_sort_overrides_default_order() {
        let request = PivotRequest {
            group_by: vec!["Region".to_string(), "Country".to_string()],
            metrics: vec![MetricDefinition::aggregate("Sales", "Sales", AggregateFunction::Sum)],
            sort: Some(vec![SortKey::desc("Sales")]),
            ..Default::default()
        };
        let sql = compile_pivot(BASE, &request, Dialect::Postgres).unwrap().sql;
        assert!(sql.ends_with(" GROUP BY \"Region\", \"Country\" ORDER BY \"Sales\" DESC"), "{sql}");
    }

    #[test]
    fn test_split_by_extends_grouping() {
        let request = PivotRequest {
            group_by: vec!["Region".to_string()],
            split_by: Some("Country".to_string()),
            metrics: vec![MetricDefinition::aggregate("Sales", "Sales", AggregateFunction::Sum)],
            ..Default::default()
        };
        let sql = compile_pivot(BASE, &request, Dialect::MsSql).unwrap().sql;
        assert!(sql.starts_with("SELECT [Region], [Country], SUM([Sales]) AS [Sales]"), "{sql}");
        assert!(sql.ends_with("GROUP BY [Region], [Country] ORDER BY [Region] ASC, [Country] ASC"), "{sql}");
    }

    #[test]
    fn test_dialect_isomorphism() {
        let request = PivotRequest {
            group_by: vec!["Region".to_string(), "Country".to_string()],
            metrics: vec![
                MetricDefinition::aggregate("Sales", "Sales", AggregateFunction::Sum),
                MetricDefinition::margin("Margin", "Venduto", "Costo"),
            ],
            filters: filters(&[
                ("Region", ColumnFilter::new(FilterOperator::Contains, "Eur")),
                ("Sales", ColumnFilter::new(FilterOperator::GreaterThan, 10)),
            ]),
            sort: Some(vec![SortKey::desc("Margin")]),
            ..Default::default()
        };

        let compiled: Vec<CompiledQuery> = [Dialect::MsSql, Dialect::Postgres, Dialect::MySql]
            .into_iter()
            .map(|d| compile_pivot(BASE, &request, d).unwrap())
            .collect();

        let normalized: Vec<String> = compiled.iter().map(|c| normalize(&c.sql)).collect();
        assert_eq!(normalized[0], normalized[1]);
        assert_eq!(normalized[1], normalized[2]);
        assert_eq!(compiled[0].params, compiled[1].params);
        assert_eq!(compiled[1].params, compiled[2].params);
    }

    #[test]
    fn test_no_literals_in_sql_text() {
        let request = PivotRequest {
            group_by: vec!["Region".to_string()],
            filters: filters(&[("Region", ColumnFilter::new(FilterOperator::Equals, "x' OR '1'='1"))]),
            ..Default::default()
        };
        let compiled = compile_pivot(BASE, &request, Dialect::Postgres).unwrap();
        assert!(!compiled.sql.contains("OR '1'='1"));
        assert_eq!(compiled.params, vec![SqlParam::Text("x' OR '1'='1".to_string())]);
    }

    #[test]
    fn test_duplicate_metric_names_fail() {
        let request = PivotRequest {
            metrics: vec![
                MetricDefinition::aggregate("Sales", "Sales", AggregateFunction::Sum),
                MetricDefinition::margin("Sales", "Venduto", "Costo"),
            ],
            ..Default::default()
        };
        assert!(matches!(
            compile_pivot(BASE, &request, Dialect::MsSql),
            Err(ConfigError::DuplicateMetric { .. })
        ));
    }
}
