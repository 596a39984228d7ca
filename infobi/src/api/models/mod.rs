//! API request and response data models.
//!
//! - [`pivot`]: pivot configuration (grouping, metrics, filters, sort)
//! - [`grid`]: ag-grid server-side row model requests (flat pages and drill levels)
//! - [`query`]: shared building blocks: aggregates, filters, sort keys
//! - [`reports`]: report schema, test query and cache maintenance payloads
//!
//! Field names follow what browser grid components send: camelCase for grid models, snake_case
//! for pivot and report payloads.

pub mod grid;
pub mod pivot;
pub mod query;
pub mod reports;
