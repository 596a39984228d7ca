//! Report endpoints: grid pages, raw data, filter values, cache refresh and test queries.

use super::arrow_response;
use crate::AppState;
use crate::api::models::grid::{GridRequest, GridResponse};
use crate::api::models::pivot::RefreshParams;
use crate::api::models::reports::{RefreshCacheResponse, TestQueryRequest, TestQueryResponse};
use crate::errors::Result;
use axum::{
    Json,
    extract::{Path, Query, State},
    response::Response,
};
use serde_json::Value;

#[utoipa::path(
    post,
    path = "/api/reports/{report_id}/grid",
    tag = "reports",
    summary = "Grid page",
    description = "Rows `[startRow, endRow)` of the filtered, sorted report plus the total row count in `lastRow`.",
    request_body = GridRequest,
    params(("report_id" = i64, Path, description = "Report ID")),
    responses(
        (status = 200, description = "Page of rows", body = GridResponse),
        (status = 400, description = "Invalid request or query failure"),
        (status = 404, description = "Report not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn grid(
    State(state): State<AppState>,
    Path(report_id): Path<i64>,
    Json(request): Json<GridRequest>,
) -> Result<Json<GridResponse>> {
    Ok(Json(state.engine.grid(report_id, request).await?))
}

#[utoipa::path(
    get,
    path = "/api/reports/{report_id}/data",
    tag = "reports",
    summary = "Raw report data",
    description = "The report's base query result, unaggregated, as an Arrow IPC stream.",
    params(
        ("report_id" = i64, Path, description = "Report ID"),
        RefreshParams,
    ),
    responses(
        (status = 200, description = "Arrow IPC stream", content_type = "application/vnd.apache.arrow.stream"),
        (status = 400, description = "Query failure"),
        (status = 404, description = "Report not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn report_data(
    State(state): State<AppState>,
    Path(report_id): Path<i64>,
    Query(params): Query<RefreshParams>,
) -> Result<Response> {
    let payload = state.engine.report_data(report_id, params.force_refresh).await?;
    Ok(arrow_response(payload))
}

#[utoipa::path(
    get,
    path = "/api/reports/{report_id}/columns/{column}/values",
    tag = "reports",
    summary = "Distinct column values",
    description = "Sorted distinct non-null values of a column, for filter pickers. \
                   Query failures yield an empty list.",
    params(
        ("report_id" = i64, Path, description = "Report ID"),
        ("column" = String, Path, description = "Column name"),
    ),
    responses(
        (status = 200, description = "Distinct values", body = Vec<Object>),
        (status = 404, description = "Report not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn column_values(
    State(state): State<AppState>,
    Path((report_id, column)): Path<(i64, String)>,
) -> Result<Json<Vec<Value>>> {
    Ok(Json(state.engine.distinct_values(report_id, &column).await?))
}

#[utoipa::path(
    post,
    path = "/api/reports/{report_id}/refresh-cache",
    tag = "reports",
    summary = "Refresh report cache",
    description = "Drop every cached result of the report so the next request re-runs its query.",
    params(("report_id" = i64, Path, description = "Report ID")),
    responses(
        (status = 200, description = "Cache invalidated", body = RefreshCacheResponse),
        (status = 404, description = "Report not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn refresh_cache(State(state): State<AppState>, Path(report_id): Path<i64>) -> Result<Json<RefreshCacheResponse>> {
    let removed = state.engine.invalidate(report_id).await?;
    Ok(Json(RefreshCacheResponse {
        success: true,
        message: format!("Cache invalidated for report {report_id}"),
        removed,
    }))
}

#[utoipa::path(
    post,
    path = "/api/reports/test-query",
    tag = "reports",
    summary = "Test a query",
    description = "Run a query on a connection with a 100-row cap and report the columns it returns.",
    request_body = TestQueryRequest,
    responses(
        (status = 200, description = "Query ran", body = TestQueryResponse),
        (status = 400, description = "Query failure"),
        (status = 404, description = "Connection not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn test_query(State(state): State<AppState>, Json(request): Json<TestQueryRequest>) -> Result<Json<TestQueryResponse>> {
    Ok(Json(state.engine.test_query(&request).await?))
}

#[cfg(test)]
mod tests {
    use crate::api::handlers::{CACHE_HIT_HEADER, ROW_COUNT_HEADER};
    use crate::dialect::Dialect;
    use crate::execution::columns::{Cell, ColumnDescriptor, ColumnKind};
    use crate::query::grid::TOTAL_ROWS_COLUMN;
    use crate::serialization::decode_stream;
    use crate::test_utils::{StubProvider, StubResponse, create_test_app};
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn orders(count: usize) -> StubResponse {
        StubResponse::rows(
            vec![
                ColumnDescriptor::new("OrderId", ColumnKind::Int64),
                ColumnDescriptor::new("Region", ColumnKind::Utf8),
            ],
            (0..count)
                .map(|i| vec![Cell::Int(i as i64), Cell::Text("Europe".into())])
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_grid_endpoint() {
        let provider = Arc::new(StubProvider::new(Dialect::MsSql));
        provider.push_for(
            "COUNT(*)",
            StubResponse::rows(vec![ColumnDescriptor::new(TOTAL_ROWS_COLUMN, ColumnKind::Int64)], vec![vec![Cell::Int(250)]]),
        );
        provider.push(orders(50));
        let server = create_test_app(provider.clone());

        let response = server
            .post("/api/reports/1/grid")
            .json(&json!({
                "startRow": 100,
                "endRow": 150,
                "sortModel": [{"colId": "OrderId", "sort": "asc"}],
                "filterModel": {"Region": {"filterType": "text", "type": "equals", "filter": "Europe"}}
            }))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["lastRow"], 250);
        assert_eq!(body["rows"].as_array().unwrap().len(), 50);

        let page = provider
            .executed()
            .into_iter()
            .find(|q| !q.sql.contains("COUNT(*)"))
            .unwrap();
        assert!(page.sql.ends_with("ORDER BY [OrderId] ASC OFFSET 100 ROWS FETCH NEXT 50 ROWS ONLY"), "{}", page.sql);
    }

    #[tokio::test]
    async fn test_grid_inverted_range() {
        let server = create_test_app(Arc::new(StubProvider::new(Dialect::MsSql)));
        let response = server
            .post("/api/reports/1/grid")
            .json(&json!({"startRow": 20, "endRow": 10}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_report_data_and_refresh_cache() {
        let provider = Arc::new(StubProvider::new(Dialect::Postgres));
        provider.push(orders(3));
        provider.push(orders(3));
        let server = create_test_app(provider.clone());

        let first = server.get("/api/reports/1/data").await;
        first.assert_status_ok();
        assert_eq!(first.header(ROW_COUNT_HEADER), "3");
        let (_, batches) = decode_stream(first.as_bytes()).unwrap();
        assert_eq!(batches[0].num_rows(), 3);
        assert_eq!(
            provider.executed()[0].sql,
            "SELECT Region, Country, Sales, Venduto, Costo FROM sales_facts"
        );

        let cached = server.get("/api/reports/1/data").await;
        assert_eq!(cached.header(CACHE_HIT_HEADER), "true");

        let refresh = server.post("/api/reports/1/refresh-cache").await;
        refresh.assert_status_ok();
        let body: Value = refresh.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["removed"], 1);

        let fresh = server.get("/api/reports/1/data").await;
        assert_eq!(fresh.header(CACHE_HIT_HEADER), "false");
        assert_eq!(provider.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_cache_unknown_report() {
        let server = create_test_app(Arc::new(StubProvider::new(Dialect::Postgres)));
        server
            .post("/api/reports/42/refresh-cache")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_column_values() {
        let provider = Arc::new(StubProvider::new(Dialect::MySql));
        provider.push(StubResponse::rows(
            vec![ColumnDescriptor::new("Region", ColumnKind::Utf8)],
            vec![vec![Cell::Text("Asia".into())], vec![Cell::Text("Europe".into())]],
        ));
        let server = create_test_app(provider.clone());

        let response = server.get("/api/reports/1/columns/Region/values").await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>(), json!(["Asia", "Europe"]));
        assert!(provider.executed()[0].sql.starts_with("SELECT DISTINCT `Region`"));
    }

    #[tokio::test]
    async fn test_column_values_failure_is_empty() {
        let provider = Arc::new(StubProvider::new(Dialect::MySql));
        provider.push(StubResponse::failure("Unknown column 'Nope'"));
        let server = create_test_app(provider);

        let response = server.get("/api/reports/1/columns/Nope/values").await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>(), json!([]));
    }

    #[tokio::test]
    async fn test_test_query_endpoint() {
        let provider = Arc::new(StubProvider::new(Dialect::MsSql));
        provider.push(orders(2));
        let server = create_test_app(provider.clone());

        let response = server
            .post("/api/reports/test-query")
            .json(&json!({"connection_id": 1, "query": "SELECT * FROM orders"}))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(
            body,
            json!({"success": true, "row_count": 2, "columns": ["OrderId", "Region"], "message": "Query executed successfully"})
        );
        assert_eq!(
            provider.executed()[0].sql,
            "SELECT TOP 100 * FROM (SELECT * FROM orders) AS limited_data"
        );
    }

    #[tokio::test]
    async fn test_test_query_unknown_connection() {
        let server = create_test_app(Arc::new(StubProvider::new(Dialect::MsSql)));
        server
            .post("/api/reports/test-query")
            .json(&json!({"connection_id": 7, "query": "SELECT 1"}))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_test_query_backend_error() {
        let provider = Arc::new(StubProvider::new(Dialect::MsSql));
        provider.push(StubResponse::failure("Incorrect syntax near 'FORM'."));
        let server = create_test_app(provider);

        let response = server
            .post("/api/reports/test-query")
            .json(&json!({"connection_id": 1, "query": "SELECT * FORM orders"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }
}
