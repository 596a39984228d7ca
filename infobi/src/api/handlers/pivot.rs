//! Pivot endpoints: aggregated runs, report schema and lazy drill-down.

use super::arrow_response;
use crate::AppState;
use crate::api::models::grid::{DrillResponse, PivotDrillRequest};
use crate::api::models::pivot::{PivotRequest, RefreshParams};
use crate::api::models::reports::ReportSchema;
use crate::errors::Result;
use axum::{
    Json,
    extract::{Path, Query, State},
    response::Response,
};

#[utoipa::path(
    post,
    path = "/api/pivot/{report_id}",
    tag = "pivot",
    summary = "Run a pivot",
    description = "Aggregate the report's data and return it as an Arrow IPC stream. \
                   `X-Cache-Hit` tells whether the result came from cache.",
    request_body = PivotRequest,
    params(
        ("report_id" = i64, Path, description = "Report ID"),
        RefreshParams,
    ),
    responses(
        (status = 200, description = "Arrow IPC stream", content_type = "application/vnd.apache.arrow.stream"),
        (status = 400, description = "Invalid request or query failure"),
        (status = 404, description = "Report not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn run_pivot(
    State(state): State<AppState>,
    Path(report_id): Path<i64>,
    Query(params): Query<RefreshParams>,
    Json(request): Json<PivotRequest>,
) -> Result<Response> {
    let payload = state.engine.pivot(report_id, request, params.force_refresh).await?;
    Ok(arrow_response(payload))
}

#[utoipa::path(
    get,
    path = "/api/pivot/{report_id}/schema",
    tag = "pivot",
    summary = "Report schema",
    description = "Columns of the report's result with coarse types and display labels, plus metric defaults.",
    params(("report_id" = i64, Path, description = "Report ID")),
    responses(
        (status = 200, description = "Report schema", body = ReportSchema),
        (status = 404, description = "Report not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_schema(State(state): State<AppState>, Path(report_id): Path<i64>) -> Result<Json<ReportSchema>> {
    Ok(Json(state.engine.schema(report_id).await?))
}

#[utoipa::path(
    post,
    path = "/api/pivot/{report_id}/drill",
    tag = "pivot",
    summary = "Expand a grouping level",
    description = "Children of the node identified by `groupKeys`. A leaf node has no children.",
    request_body = PivotDrillRequest,
    params(("report_id" = i64, Path, description = "Report ID")),
    responses(
        (status = 200, description = "Child rows", body = DrillResponse),
        (status = 400, description = "Invalid request or query failure"),
        (status = 404, description = "Report not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn drill(
    State(state): State<AppState>,
    Path(report_id): Path<i64>,
    Json(request): Json<PivotDrillRequest>,
) -> Result<Json<DrillResponse>> {
    Ok(Json(state.engine.drill(report_id, request).await?))
}
