//! OpenAPI documentation for the HTTP API, served by Scalar at `/docs`.

use crate::api;
use crate::api::models::{grid, pivot, query, reports};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "infobi API",
        description = "Pivot, grid and drill-down queries over saved SQL reports. \
                       Pivot and raw-data results are Arrow IPC streams; everything else is JSON."
    ),
    paths(
        api::handlers::pivot::run_pivot,
        api::handlers::pivot::get_schema,
        api::handlers::pivot::drill,
        api::handlers::reports::grid,
        api::handlers::reports::report_data,
        api::handlers::reports::column_values,
        api::handlers::reports::refresh_cache,
        api::handlers::reports::test_query,
        api::handlers::health::health,
    ),
    components(
        schemas(
            pivot::PivotRequest,
            pivot::MetricWire,
            query::AggregateFunction,
            query::FilterOperator,
            query::ColumnFilter,
            query::SortDirection,
            query::SortKey,
            grid::GridRequest,
            grid::GridResponse,
            grid::ValueColumn,
            grid::PivotDrillRequest,
            grid::DrillResponse,
            reports::ColumnType,
            reports::ColumnInfo,
            reports::ReportSchema,
            reports::TestQueryRequest,
            reports::TestQueryResponse,
            reports::RefreshCacheResponse,
            api::handlers::health::HealthResponse,
        )
    ),
    tags(
        (name = "pivot", description = "Aggregated pivots and drill-down"),
        (name = "reports", description = "Grid pages, raw data and report maintenance"),
        (name = "health", description = "Liveness"),
    )
)]
pub struct ApiDoc;
