//! One level of a lazily expanded grouping hierarchy.
//!
//! The request carries the path to the node being expanded (`groupKeys`), so nothing is kept
//! between calls. Level `d` groups by `rowGroupCols[d]` (plus any pivot columns) under the
//! equality constraints of the ancestors `rowGroupCols[0..d]`.

use super::{Binder, CompiledQuery, SqlParam, derived_table, filter_model_predicates, sanitized_column, where_clause};
use crate::api::models::grid::PivotDrillRequest;
use crate::api::models::query::AggregateFunction;
use crate::dialect::Dialect;
use crate::errors::ConfigError;

/// Compile the query returning the children of the requested node.
///
/// Returns `Ok(None)` when the node is a leaf (as many keys as grouping levels): it has no
/// children and the backend does not need to be asked.
pub fn compile_drill(base_query: &str, request: &PivotDrillRequest, dialect: Dialect) -> Result<Option<CompiledQuery>, ConfigError> {
    request.validate()?;
    if request.is_leaf() {
        return Ok(None);
    }

    let depth = request.depth();
    let active = sanitized_column(&request.row_group_cols[depth], dialect).ok_or_else(|| {
        ConfigError::invalid(format!("Invalid grouping column '{}'", request.row_group_cols[depth]))
    })?;

    let mut group_items = vec![active.clone()];
    group_items.extend(request.pivot_cols.iter().filter_map(|c| sanitized_column(c, dialect)));

    let mut select_items = group_items.clone();
    let mut value_aliases = Vec::with_capacity(request.value_cols.len());
    for value_col in &request.value_cols {
        let Some(column) = sanitized_column(&value_col.column, dialect) else {
            continue;
        };
        let expression = match value_col.agg_func {
            AggregateFunction::Count => "COUNT(*)".to_string(),
            function => format!("{}({column})", function.as_sql()),
        };
        select_items.push(format!("{expression} AS {column}"));
        value_aliases.push(column);
    }

    let mut binder = Binder::new(dialect);
    let mut predicates = Vec::with_capacity(depth + request.filter_model.len());
    for (column, key) in request.row_group_cols.iter().zip(&request.group_keys) {
        let column_sql = sanitized_column(column, dialect)
            .ok_or_else(|| ConfigError::invalid(format!("Invalid grouping column '{column}'")))?;
        // Rows whose grouping value is NULL form their own node at the parent level
        if key.is_null() {
            predicates.push(format!("{column_sql} IS NULL"));
        } else {
            let placeholder = binder.bind(SqlParam::from_json(key)?);
            predicates.push(format!("{column_sql} = {placeholder}"));
        }
    }
    predicates.extend(filter_model_predicates(&request.filter_model, dialect, &mut binder)?);

    let mut sql = format!("SELECT {} FROM {}", select_items.join(", "), derived_table(base_query));
    sql.push_str(&where_clause(&predicates));
    sql.push_str(&format!(" GROUP BY {}", group_items.join(", ")));

    // Only columns present in this level's output can be ordered on
    let order_items: Vec<String> = request
        .sort_model
        .iter()
        .filter_map(|key| {
            let column = sanitized_column(&key.column, dialect)?;
            (group_items.contains(&column) || value_aliases.contains(&column)).then(|| format!("{column} {}", key.direction.as_sql()))
        })
        .collect();
    if order_items.is_empty() {
        sql.push_str(&format!(" ORDER BY {active} ASC"));
    } else {
        sql.push_str(&format!(" ORDER BY {}", order_items.join(", ")));
    }

    Ok(Some(binder.finish(sql)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::grid::ValueColumn;
    use crate::api::models::query::{ColumnFilter, FilterOperator, SortKey};
    use crate::query::tests::normalize;
    use serde_json::json;

    const BASE: &str = "SELECT Region, Country, City, Sales FROM sales_facts";

    fn request(group_keys: Vec<serde_json::Value>) -> PivotDrillRequest {
        PivotDrillRequest {
            row_group_cols: vec!["Region".to_string(), "Country".to_string()],
            value_cols: vec![ValueColumn {
                column: "Sales".to_string(),
                agg_func: AggregateFunction::Sum,
            }],
            group_keys,
            ..Default::default()
        }
    }

    #[test]
    fn test_root_level() {
        let compiled = compile_drill(BASE, &request(vec![]), Dialect::Postgres).unwrap().unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT \"Region\", SUM(\"Sales\") AS \"Sales\" FROM (SELECT Region, Country, City, Sales FROM sales_facts) AS base_data \
             GROUP BY \"Region\" ORDER BY \"Region\" ASC"
        );
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn test_children_of_europe() {
        let compiled = compile_drill(BASE, &request(vec![json!("Europe")]), Dialect::MsSql)
            .unwrap()
            .unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT [Country], SUM([Sales]) AS [Sales] FROM (SELECT Region, Country, City, Sales FROM sales_facts) AS base_data \
             WHERE [Region] = @P1 GROUP BY [Country] ORDER BY [Country] ASC"
        );
        assert_eq!(compiled.params, vec![SqlParam::Text("Europe".to_string())]);
    }

    #[test]
    fn test_leaf_has_no_query() {
        let compiled = compile_drill(BASE, &request(vec![json!("Europe"), json!("Italy")]), Dialect::MySql).unwrap();
        assert!(compiled.is_none());
    }

    #[test]
    fn test_too_many_keys_fails() {
        let result = compile_drill(
            BASE,
            &request(vec![json!("Europe"), json!("Italy"), json!("Rome")]),
            Dialect::MySql,
        );
        assert!(matches!(result, Err(ConfigError::DrillDepthExceeded { depth: 3, levels: 2 })));
    }

    #[test]
    fn test_count_pivot_cols_and_filters() {
        let mut request = request(vec![json!("Europe")]);
        request.value_cols.push(ValueColumn {
            column: "Orders".to_string(),
            agg_func: AggregateFunction::Count,
        });
        request.pivot_cols = vec!["Year".to_string()];
        request
            .filter_model
            .insert("City".to_string(), ColumnFilter::new(FilterOperator::StartsWith, "Mi"));
        request.sort_model = vec![SortKey::desc("Sales"), SortKey::asc("NotInOutput")];

        let compiled = compile_drill(BASE, &request, Dialect::MySql).unwrap().unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT `Country`, `Year`, SUM(`Sales`) AS `Sales`, COUNT(*) AS `Orders` \
             FROM (SELECT Region, Country, City, Sales FROM sales_facts) AS base_data \
             WHERE `Region` = ? AND `City` LIKE ? GROUP BY `Country`, `Year` ORDER BY `Sales` DESC"
        );
        assert_eq!(
            compiled.params,
            vec![SqlParam::Text("Europe".to_string()), SqlParam::Text("Mi%".to_string())]
        );
    }

    #[test]
    fn test_null_group_key_expands() {
        let compiled = compile_drill(BASE, &request(vec![json!(null)]), Dialect::Postgres)
            .unwrap()
            .unwrap();
        assert!(compiled.sql.contains("WHERE \"Region\" IS NULL GROUP BY \"Country\""), "{}", compiled.sql);
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn test_numeric_group_keys_stay_numeric() {
        let request = PivotDrillRequest {
            row_group_cols: vec!["Year".to_string(), "Month".to_string()],
            group_keys: vec![json!(2024)],
            ..Default::default()
        };
        let compiled = compile_drill(BASE, &request, Dialect::Postgres).unwrap().unwrap();
        assert_eq!(compiled.params, vec![SqlParam::Int(2024)]);
    }

    #[test]
    fn test_dialect_isomorphism() {
        let request = request(vec![json!("Europe")]);
        let sqls: Vec<String> = [Dialect::MsSql, Dialect::Postgres, Dialect::MySql]
            .into_iter()
            .map(|d| normalize(&compile_drill(BASE, &request, d).unwrap().unwrap().sql))
            .collect();
        assert_eq!(sqls[0], sqls[1]);
        assert_eq!(sqls[1], sqls[2]);
    }
}
