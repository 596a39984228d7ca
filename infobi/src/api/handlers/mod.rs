//! HTTP request handlers.
//!
//! Handlers are thin: they extract path, query and body, call the [`crate::engine::Engine`] and
//! shape the response. Errors are returned as [`crate::errors::Error`], which renders the status
//! code and a `{"detail": ...}` body.
//!
//! - [`pivot`]: pivot runs, report schema and drill-down
//! - [`reports`]: grid pages, raw data, distinct values, cache refresh and test queries
//! - [`health`]: liveness

pub mod health;
pub mod pivot;
pub mod reports;

use crate::engine::ArrowPayload;
use crate::serialization::ARROW_STREAM_MEDIA_TYPE;
use axum::http::{HeaderName, header};
use axum::response::{IntoResponse, Response};

/// Milliseconds spent serving the request, one decimal.
pub const QUERY_TIME_HEADER: HeaderName = HeaderName::from_static("x-query-time");
/// `true` when the payload came from the result cache.
pub const CACHE_HIT_HEADER: HeaderName = HeaderName::from_static("x-cache-hit");
/// Rows in the payload, or `cached` when it was not re-counted.
pub const ROW_COUNT_HEADER: HeaderName = HeaderName::from_static("x-row-count");

/// Arrow IPC stream response with timing and cache headers.
pub(crate) fn arrow_response(payload: ArrowPayload) -> Response {
    let query_time = format!("{:.1}", payload.elapsed.as_secs_f64() * 1000.0);
    let row_count = payload
        .row_count
        .map(|count| count.to_string())
        .unwrap_or_else(|| "cached".to_string());

    (
        [
            (header::CONTENT_TYPE, ARROW_STREAM_MEDIA_TYPE.to_string()),
            (QUERY_TIME_HEADER, query_time),
            (CACHE_HIT_HEADER, payload.cache_hit.to_string()),
            (ROW_COUNT_HEADER, row_count),
        ],
        payload.bytes,
    )
        .into_response()
}
