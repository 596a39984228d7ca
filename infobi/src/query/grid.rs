//! Flat grid paging: a count statement and a page statement sharing one filter clause.

use super::{Binder, CompiledQuery, derived_table, filter_model_predicates, sort_model_items, where_clause};
use crate::api::models::grid::GridRequest;
use crate::dialect::Dialect;
use crate::errors::ConfigError;

/// Output column of the count statement.
pub const TOTAL_ROWS_COLUMN: &str = "total_rows";

/// The two statements behind one grid page.
#[derive(Debug, Clone, PartialEq)]
pub struct GridQueries {
    /// Single row, single column ([`TOTAL_ROWS_COLUMN`]) with the number of matching rows
    pub count: CompiledQuery,
    /// At most `endRow - startRow` rows starting at `startRow`; `None` for an empty window,
    /// which SQL Server cannot express as `FETCH NEXT 0 ROWS`
    pub page: Option<CompiledQuery>,
    pub page_size: u64,
}

pub fn compile_grid(base_query: &str, request: &GridRequest, dialect: Dialect) -> Result<GridQueries, ConfigError> {
    let page_size = request.page_size()?;

    // Each statement numbers its own placeholders, so render the filters once per statement
    let mut count_binder = Binder::new(dialect);
    let count_where = where_clause(&filter_model_predicates(&request.filter_model, dialect, &mut count_binder)?);
    let count = count_binder.finish(format!(
        "SELECT COUNT(*) AS {TOTAL_ROWS_COLUMN} FROM {}{count_where}",
        derived_table(base_query)
    ));

    if page_size == 0 {
        return Ok(GridQueries {
            count,
            page: None,
            page_size,
        });
    }

    let mut page_binder = Binder::new(dialect);
    let page_where = where_clause(&filter_model_predicates(&request.filter_model, dialect, &mut page_binder)?);
    let mut sql = format!("SELECT * FROM {}{page_where}", derived_table(base_query));

    let order_items = sort_model_items(&request.sort_model, dialect);
    if !order_items.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order_items.join(", ")));
    } else if dialect.pagination_requires_order() {
        sql.push_str(" ORDER BY (SELECT NULL)");
    }
    sql.push(' ');
    sql.push_str(&dialect.pagination(page_size, request.start_row));

    Ok(GridQueries {
        count,
        page: Some(page_binder.finish(sql)),
        page_size,
    })
}
