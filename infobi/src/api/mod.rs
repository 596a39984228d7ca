//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures
//!
//! # API Structure
//!
//! - **Pivot** (`/api/pivot/*`): aggregated pivots, report schema, drill-down
//! - **Reports** (`/api/reports/*`): grid pages, raw data, distinct values, cache refresh, test queries
//! - **Health** (`/health`)
//!
//! Request models are documented with `utoipa`; the rendered reference is served at `/docs`.

pub mod handlers;
pub mod models;
