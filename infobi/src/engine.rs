//! Request orchestration.
//!
//! Every operation follows the same path: resolve the report and its connection from the
//! catalog, compile SQL over the report's base query, consult the cache (pivot and raw data
//! only), execute, then encode. The engine holds no per-request state; the only shared mutable
//! state is the result cache, the executor map inside the provider and the memoized column lists
//! used for identifier validation.

use crate::api::models::grid::{DrillResponse, GridRequest, GridResponse, PivotDrillRequest};
use crate::api::models::pivot::{MetricDefinition, MetricKind, PivotRequest};
use crate::api::models::query::{ColumnFilter, SortKey};
use crate::api::models::reports::{ColumnInfo, ColumnType, ReportSchema, TestQueryRequest, TestQueryResponse};
use crate::cache::{ArtifactKind, ResultCache, config_hash};
use crate::catalog::{ReportCatalog, ReportDefinition};
use crate::config::EngineConfig;
use crate::dialect::Dialect;
use crate::errors::{ConfigError, Result};
use crate::execution::{ExecutionError, ExecutorProvider, QueryExecutor, QueryOutput};
use crate::query::drill::compile_drill;
use crate::query::grid::{TOTAL_ROWS_COLUMN, compile_grid};
use crate::query::pivot::compile_pivot;
use crate::query::{CompiledQuery, distinct::compile_distinct};
use crate::serialization::{batches_to_json_rows, encode_stream, first_column_values};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Row cap applied to test queries.
pub const TEST_QUERY_LIMIT: u64 = 100;

/// An encoded Arrow IPC stream plus what the transport reports about it.
#[derive(Debug, Clone)]
pub struct ArrowPayload {
    pub bytes: Bytes,
    /// `None` when served from cache (the payload is not decoded to count rows)
    pub row_count: Option<usize>,
    pub cache_hit: bool,
    pub elapsed: Duration,
}

/// Fields that identify a pivot result. Field order does not matter: the digest is taken over
/// canonical JSON.
#[derive(Serialize)]
struct PivotFingerprint<'a> {
    query: &'a str,
    group_by: &'a [String],
    split_by: Option<&'a str>,
    metrics: &'a [MetricDefinition],
    filters: &'a BTreeMap<String, ColumnFilter>,
    sort: Option<&'a [SortKey]>,
    mode: &'static str,
}

#[derive(Serialize)]
struct QueryFingerprint<'a> {
    query: &'a str,
    mode: &'static str,
}

fn fingerprint(value: impl Serialize) -> Result<String> {
    let json = serde_json::to_value(value).map_err(|e| anyhow::anyhow!("failed to fingerprint request: {e}"))?;
    Ok(config_hash(&json))
}

/// A resolved report with the executor of its connection.
struct ReportContext {
    report: ReportDefinition,
    executor: Arc<dyn QueryExecutor>,
}

impl ReportContext {
    fn dialect(&self) -> Dialect {
        self.executor.dialect()
    }
}

/// Fill margin fields a request left empty from the report's metric of the same name.
fn complete_margin(metric: MetricDefinition, available: &[MetricDefinition]) -> MetricDefinition {
    let MetricKind::Margin {
        revenue_field,
        cost_field,
    } = &metric.kind
    else {
        return metric;
    };
    if !revenue_field.is_empty() && !cost_field.is_empty() {
        return metric;
    }
    let Some(MetricKind::Margin {
        revenue_field: template_revenue,
        cost_field: template_cost,
    }) = available.iter().find(|m| m.name == metric.name).map(|m| &m.kind)
    else {
        return metric;
    };

    let pick = |own: &String, template: &String| if own.is_empty() { template.clone() } else { own.clone() };
    let kind = MetricKind::Margin {
        revenue_field: pick(revenue_field, template_revenue),
        cost_field: pick(cost_field, template_cost),
    };
    MetricDefinition { kind, ..metric }
}

/// Apply the report's defaults to a pivot request.
fn resolve_pivot_defaults(report: &ReportDefinition, mut request: PivotRequest) -> PivotRequest {
    if request.group_by.is_empty() {
        request.group_by = report.default_group_by.clone();
    }
    if request.metrics.is_empty() {
        request.metrics = report.default_metrics.clone();
    }
    request.metrics = request
        .metrics
        .into_iter()
        .map(|metric| complete_margin(metric, &report.available_metrics))
        .collect();
    request
}

/// A statement without surrounding whitespace or trailing semicolons, ready to nest as a subquery.
fn statement_body(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn record_query(operation: &'static str, output: &QueryOutput) {
    metrics::histogram!("infobi_query_duration_seconds", "operation" => operation).record(output.elapsed.as_secs_f64());
    metrics::counter!("infobi_rows_returned_total", "operation" => operation).increment(output.row_count as u64);
}

/// Read the single value of a `COUNT(*)` result.
fn count_value(output: &QueryOutput) -> Result<u64> {
    let rows = batches_to_json_rows(&output.batches).map_err(ExecutionError::from)?;
    let count = rows
        .first()
        .and_then(|row| row.get(TOTAL_ROWS_COLUMN).or_else(|| row.values().next()))
        .and_then(|value| value.as_u64().or_else(|| value.as_f64().map(|f| f as u64)))
        .unwrap_or(0);
    Ok(count)
}

async fn encode(output: QueryOutput) -> Result<Bytes> {
    let bytes = tokio::task::spawn_blocking(move || encode_stream(&output.schema, &output.batches))
        .await
        .map_err(ExecutionError::from)?
        .map_err(ExecutionError::from)?;
    Ok(bytes)
}

/// Pivot, grid and drill operations over catalogued reports.
pub struct Engine {
    catalog: Arc<dyn ReportCatalog>,
    backends: Arc<dyn ExecutorProvider>,
    cache: ResultCache,
    settings: EngineConfig,
    /// Column names per report, filled on first use when identifier validation is on
    columns: moka::future::Cache<i64, Arc<Vec<String>>>,
}

impl Engine {
    pub fn new(
        catalog: Arc<dyn ReportCatalog>,
        backends: Arc<dyn ExecutorProvider>,
        cache: ResultCache,
        settings: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            backends,
            cache,
            settings,
            columns: moka::future::Cache::new(10_000),
        }
    }

    async fn context(&self, report_id: i64) -> Result<ReportContext> {
        let report = self.catalog.report(report_id).await?;
        let connection = self.catalog.connection(report.connection_id).await?;
        let executor = self.backends.executor(&connection).await?;
        Ok(ReportContext { report, executor })
    }

    /// Column names of a report's result, probed with a one-row query and memoized.
    async fn report_columns(&self, context: &ReportContext) -> Result<Arc<Vec<String>>> {
        let report_id = context.report.id;
        if let Some(columns) = self.columns.get(&report_id).await {
            return Ok(columns);
        }
        let probe = CompiledQuery::raw(context.dialect().limit_rows(statement_body(&context.report.query), 1));
        let output = context.executor.execute(&probe).await?;
        let columns: Arc<Vec<String>> = Arc::new(output.schema.fields().iter().map(|f| f.name().clone()).collect());
        self.columns.insert(report_id, columns.clone()).await;
        Ok(columns)
    }

    /// With `validate_identifiers` on, reject columns absent from the report's result.
    async fn check_columns<'a>(&self, context: &ReportContext, referenced: impl IntoIterator<Item = &'a str>) -> Result<()> {
        if !self.settings.validate_identifiers {
            return Ok(());
        }
        let known = self.report_columns(context).await?;
        for column in referenced {
            if !known.iter().any(|k| k.eq_ignore_ascii_case(column)) {
                return Err(ConfigError::UnknownColumn {
                    column: column.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Run a pivot and return it as an Arrow stream.
    ///
    /// The cache key is computed from the request as sent, before report defaults are applied.
    /// `force_refresh` skips the cache read but still stores the fresh result.
    #[instrument(skip_all, fields(report_id = report_id, force_refresh = force_refresh), err)]
    pub async fn pivot(&self, report_id: i64, request: PivotRequest, force_refresh: bool) -> Result<ArrowPayload> {
        let started = Instant::now();
        request.validate()?;
        let context = self.context(report_id).await?;
        let use_cache = context.report.cache_enabled;

        let hash = fingerprint(PivotFingerprint {
            query: &context.report.query,
            group_by: &request.group_by,
            split_by: request.split_by.as_deref(),
            metrics: &request.metrics,
            filters: &request.filters,
            sort: request.sort.as_deref(),
            mode: "lazy",
        })?;

        if use_cache
            && !force_refresh
            && let Some(bytes) = self.cache.get(ArtifactKind::Pivot, report_id, &hash).await
        {
            return Ok(ArrowPayload {
                bytes,
                row_count: None,
                cache_hit: true,
                elapsed: started.elapsed(),
            });
        }

        let request = resolve_pivot_defaults(&context.report, request);
        let metric_names = request.metric_names();
        let mut referenced: Vec<&str> = request.group_by.iter().map(String::as_str).collect();
        referenced.extend(request.split_by.as_deref());
        for metric in &request.metrics {
            match &metric.kind {
                MetricKind::Aggregate(_) if !metric.field.is_empty() => referenced.push(&metric.field),
                MetricKind::Margin {
                    revenue_field,
                    cost_field,
                } => referenced.extend([revenue_field.as_str(), cost_field.as_str()].into_iter().filter(|f| !f.is_empty())),
                MetricKind::Aggregate(_) => {}
            }
        }
        referenced.extend(request.filters.keys().map(String::as_str).filter(|k| !metric_names.contains(k)));
        referenced.extend(
            request
                .sort
                .iter()
                .flatten()
                .map(|key| key.column.as_str())
                .filter(|c| !metric_names.contains(c)),
        );
        self.check_columns(&context, referenced).await?;

        let compiled = compile_pivot(&context.report.query, &request, context.dialect())?;
        debug!(sql = %compiled.sql, params = compiled.params.len(), "Compiled pivot");
        let output = context.executor.execute(&compiled).await?;
        record_query("pivot", &output);
        let row_count = output.row_count;
        let bytes = encode(output).await?;

        if use_cache {
            self.cache
                .set(ArtifactKind::Pivot, report_id, &hash, bytes.clone(), None)
                .await;
        }

        info!(report_id, row_count, elapsed_ms = started.elapsed().as_millis() as u64, "Pivot executed");
        Ok(ArrowPayload {
            bytes,
            row_count: Some(row_count),
            cache_hit: false,
            elapsed: started.elapsed(),
        })
    }

    /// The report's base query, unaggregated, as an Arrow stream.
    #[instrument(skip_all, fields(report_id = report_id, force_refresh = force_refresh), err)]
    pub async fn report_data(&self, report_id: i64, force_refresh: bool) -> Result<ArrowPayload> {
        let started = Instant::now();
        let context = self.context(report_id).await?;
        let use_cache = context.report.cache_enabled;
        let hash = fingerprint(QueryFingerprint {
            query: &context.report.query,
            mode: "raw",
        })?;

        if use_cache
            && !force_refresh
            && let Some(bytes) = self.cache.get(ArtifactKind::Query, report_id, &hash).await
        {
            return Ok(ArrowPayload {
                bytes,
                row_count: None,
                cache_hit: true,
                elapsed: started.elapsed(),
            });
        }

        let output = context
            .executor
            .execute(&CompiledQuery::raw(context.report.query.clone()))
            .await?;
        record_query("report_data", &output);
        let row_count = output.row_count;
        let bytes = encode(output).await?;

        if use_cache {
            self.cache
                .set(ArtifactKind::Query, report_id, &hash, bytes.clone(), context.report.cache_ttl)
                .await;
        }

        Ok(ArrowPayload {
            bytes,
            row_count: Some(row_count),
            cache_hit: false,
            elapsed: started.elapsed(),
        })
    }

    /// One page of the flat grid plus the total row count, run concurrently.
    #[instrument(skip_all, fields(report_id = report_id, start_row = request.start_row, end_row = request.end_row), err)]
    pub async fn grid(&self, report_id: i64, mut request: GridRequest) -> Result<GridResponse> {
        let requested = request.page_size()?;
        if requested > self.settings.max_rows_preview {
            request.end_row = request.start_row + self.settings.max_rows_preview;
        }

        let context = self.context(report_id).await?;
        self.check_columns(
            &context,
            request
                .filter_model
                .keys()
                .map(String::as_str)
                .chain(request.sort_model.iter().map(|k| k.column.as_str())),
        )
        .await?;

        let queries = compile_grid(&context.report.query, &request, context.dialect())?;
        let Some(page_query) = &queries.page else {
            let count = context.executor.execute(&queries.count).await?;
            return Ok(GridResponse {
                rows: Vec::new(),
                last_row: count_value(&count)?,
            });
        };
        let (count, page) = tokio::try_join!(
            context.executor.execute(&queries.count),
            context.executor.execute(page_query)
        )?;
        record_query("grid", &page);

        let mut rows = batches_to_json_rows(&page.batches).map_err(ExecutionError::from)?;
        rows.truncate(queries.page_size as usize);
        Ok(GridResponse {
            rows,
            last_row: count_value(&count)?,
        })
    }

    /// Children of one node of the grouping hierarchy.
    #[instrument(skip_all, fields(report_id = report_id, depth = request.depth()), err)]
    pub async fn drill(&self, report_id: i64, request: PivotDrillRequest) -> Result<DrillResponse> {
        request.validate()?;
        let context = self.context(report_id).await?;

        let depth = request.depth();
        let mut referenced: Vec<&str> = request.row_group_cols.iter().take(depth + 1).map(String::as_str).collect();
        referenced.extend(request.value_cols.iter().map(|v| v.column.as_str()));
        referenced.extend(request.pivot_cols.iter().map(String::as_str));
        referenced.extend(request.filter_model.keys().map(String::as_str));
        self.check_columns(&context, referenced).await?;

        let Some(compiled) = compile_drill(&context.report.query, &request, context.dialect())? else {
            debug!(depth, "Leaf node, nothing to expand");
            return Ok(DrillResponse { rows: Vec::new(), count: 0 });
        };

        let output = context.executor.execute(&compiled).await?;
        record_query("drill", &output);
        let rows = batches_to_json_rows(&output.batches).map_err(ExecutionError::from)?;
        Ok(DrillResponse { count: rows.len(), rows })
    }

    /// Distinct non-null values of a column, sorted by the backend.
    ///
    /// Only an unknown report is an error; any other failure is logged and yields no values.
    #[instrument(skip_all, fields(report_id = report_id, column = %column), err)]
    pub async fn distinct_values(&self, report_id: i64, column: &str) -> Result<Vec<Value>> {
        let report = self.catalog.report(report_id).await?;
        match self.try_distinct_values(&report, column).await {
            Ok(values) => Ok(values),
            Err(e) => {
                warn!(report_id, column, error = %e, "Failed to load distinct values");
                Ok(Vec::new())
            }
        }
    }

    async fn try_distinct_values(&self, report: &ReportDefinition, column: &str) -> Result<Vec<Value>> {
        let connection = self.catalog.connection(report.connection_id).await?;
        let executor = self.backends.executor(&connection).await?;
        let compiled = compile_distinct(&report.query, column, executor.dialect())?;
        let output = executor.execute(&compiled).await?;
        let values = first_column_values(&output.batches).map_err(ExecutionError::from)?;
        Ok(values.into_iter().filter(|v| !v.is_null()).collect())
    }

    /// Column names, coarse types and labels of a report, plus its metric defaults.
    #[instrument(skip_all, fields(report_id = report_id), err)]
    pub async fn schema(&self, report_id: i64) -> Result<ReportSchema> {
        let context = self.context(report_id).await?;
        let probe = CompiledQuery::raw(context.dialect().limit_rows(statement_body(&context.report.query), 1));
        let output = context.executor.execute(&probe).await?;

        let report = &context.report;
        let columns: Vec<ColumnInfo> = output
            .schema
            .fields()
            .iter()
            .map(|field| ColumnInfo {
                name: field.name().clone(),
                column_type: if field.data_type().is_numeric() {
                    ColumnType::Number
                } else {
                    ColumnType::String
                },
                label: report
                    .column_labels
                    .get(field.name())
                    .cloned()
                    .unwrap_or_else(|| field.name().clone()),
            })
            .collect();

        let names = columns.iter().map(|c| c.name.clone()).collect();
        self.columns.insert(report_id, Arc::new(names)).await;

        Ok(ReportSchema {
            columns,
            default_group_by: report.default_group_by.clone(),
            default_metrics: report.default_metrics.clone(),
            available_metrics: report.available_metrics.clone(),
        })
    }

    /// Run an ad-hoc query on a connection, capped at [`TEST_QUERY_LIMIT`] rows.
    #[instrument(skip_all, fields(connection_id = request.connection_id), err)]
    pub async fn test_query(&self, request: &TestQueryRequest) -> Result<TestQueryResponse> {
        let query = statement_body(&request.query);
        if query.is_empty() {
            return Err(ConfigError::invalid("Query must not be empty").into());
        }
        let connection = self.catalog.connection(request.connection_id).await?;
        let executor = self.backends.executor(&connection).await?;
        let limited = CompiledQuery::raw(executor.dialect().limit_rows(query, TEST_QUERY_LIMIT));
        let output = executor.execute(&limited).await?;

        Ok(TestQueryResponse {
            success: true,
            row_count: output.row_count,
            columns: output.schema.fields().iter().map(|f| f.name().clone()).collect(),
            message: "Query executed successfully".to_string(),
        })
    }

    /// Drop cached results and memoized columns of a report.
    #[instrument(skip_all, fields(report_id = report_id), err)]
    pub async fn invalidate(&self, report_id: i64) -> Result<usize> {
        // Unknown reports are a 404 rather than a silent no-op
        self.catalog.report(report_id).await?;
        self.columns.invalidate(&report_id).await;
        let removed = self.cache.invalidate_report(report_id).await;
        info!(report_id, removed, "Report cache invalidated");
        Ok(removed)
    }
}
