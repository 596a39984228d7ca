//! # infobi: pivot and grid queries over saved SQL reports
//!
//! `infobi` serves interactive analytics over reports whose data comes from a stored SQL query
//! against SQL Server, PostgreSQL or MySQL. Clients ask for aggregated pivots, paginated grids and
//! lazily expanded drill-down levels; the service compiles each request into dialect-specific SQL
//! around the report's base query, runs it, and answers with an Arrow IPC stream (pivots, raw
//! data) or JSON rows (grid, drill, filter values).
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum). A request flows through:
//!
//! 1. **[`api`]** handlers, which extract the report id and request body
//! 2. **[`engine`]**, which resolves the report and its connection from the [`catalog`]
//! 3. **[`query`]** compilers, which wrap the base query as a derived table and render filters,
//!    grouping, ordering and pagination through the [`dialect`] adapter with bound parameters
//! 4. **[`cache`]**, consulted for pivots and raw data under a digest of the request
//! 5. **[`execution`]**, which runs the statement through `sqlx` (PostgreSQL, MySQL) or `tiberius`
//!    (SQL Server) and converts rows to Arrow record batches
//! 6. **[`serialization`]**, which encodes the batches as an IPC stream or JSON rows
//!
//! The cache never fails a request: store errors degrade to misses. Backend errors are reported
//! to the client with the backend's own message.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use infobi::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = infobi::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     infobi::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config)?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod crypto;
pub mod dialect;
pub mod engine;
pub mod errors;
pub mod execution;
mod openapi;
pub mod query;
pub mod serialization;
pub mod telemetry;
pub mod warmup;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use crate::api::handlers::{CACHE_HIT_HEADER, QUERY_TIME_HEADER, ROW_COUNT_HEADER};
use crate::cache::ResultCache;
use crate::catalog::{ReportCatalog, StaticCatalog};
use crate::config::CorsOrigin;
use crate::engine::Engine;
use crate::execution::{BackendPool, ExecutorProvider};
use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use bon::Builder;
pub use config::Config;
use metrics_exporter_prometheus::PrometheusBuilder;
use openapi::ApiDoc;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .engine(engine)
///     .cache(cache)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub engine: Arc<Engine>,
    /// Same cache the engine reads and writes; held here so shutdown can close it
    pub cache: ResultCache,
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let origins = &config.cors.allowed_origins;
    let allow_origin = if origins.iter().any(|o| matches!(o, CorsOrigin::Wildcard)) {
        AllowOrigin::any()
    } else {
        let mut values = Vec::with_capacity(origins.len());
        for origin in origins {
            if let CorsOrigin::Url(url) = origin {
                values.push(url.origin().ascii_serialization().parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(values)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([QUERY_TIME_HEADER, CACHE_HIT_HEADER, ROW_COUNT_HEADER]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router: API routes, docs, optional metrics, CORS, timeout and tracing.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    use api::handlers::{health, pivot, reports};

    let mut router = Router::new()
        .route("/api/pivot/{report_id}", post(pivot::run_pivot))
        .route("/api/pivot/{report_id}/schema", get(pivot::get_schema))
        .route("/api/pivot/{report_id}/drill", post(pivot::drill))
        .route("/api/reports/test-query", post(reports::test_query))
        .route("/api/reports/{report_id}/grid", post(reports::grid))
        .route("/api/reports/{report_id}/data", get(reports::report_data))
        .route("/api/reports/{report_id}/columns/{column}/values", get(reports::column_values))
        .route("/api/reports/{report_id}/refresh-cache", post(reports::refresh_cache))
        .route("/health", get(health::health))
        .with_state(state.clone())
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    if state.config.enable_metrics {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))?;
        router = router.route("/internal/metrics", get(move || std::future::ready(handle.render())));
    }

    let router = router
        .layer(create_cors_layer(&state.config)?)
        .layer(TimeoutLayer::new(state.config.engine.query_timeout))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    Ok(router)
}

/// The HTTP service with its engine and background warmup.
///
/// 1. **Create**: [`Application::new`] builds the catalog, backend pools, cache and router
/// 2. **Serve**: [`Application::serve`] binds the port and handles requests
/// 3. **Shutdown**: when the shutdown future resolves, in-flight requests finish, the cache is
///    closed and telemetry is flushed
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    warmup: Option<tokio::task::JoinHandle<warmup::WarmupSummary>>,
}

impl Application {
    /// Create a new application backed by real database connections.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting infobi with configuration: {:#?}", config);

        let key = crypto::resolve_key(config.encryption_key.as_deref());
        let backends = Arc::new(BackendPool::new(config.engine.pool_settings(), key));
        let cache = ResultCache::from_config(&config.cache);
        Self::with_components(config, backends, cache)
    }

    /// Create an application over the given backends and cache.
    pub fn with_components(config: Config, backends: Arc<dyn ExecutorProvider>, cache: ResultCache) -> anyhow::Result<Self> {
        let catalog: Arc<dyn ReportCatalog> = Arc::new(StaticCatalog::new(config.connections.clone(), config.reports.clone()));
        let engine = Arc::new(Engine::new(catalog.clone(), backends.clone(), cache.clone(), config.engine.clone()));

        let app_state = AppState::builder()
            .config(config.clone())
            .engine(engine)
            .cache(cache)
            .build();
        let router = build_router(&app_state)?;

        // Needs a runtime; constructing outside one (e.g. in a plain unit test) skips warmup
        let warmup = (config.engine.warmup_on_start && tokio::runtime::Handle::try_current().is_ok())
            .then(|| warmup::spawn_warmup(catalog, backends));

        Ok(Self {
            router,
            app_state,
            config,
            warmup,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(any(test, feature = "test-utils"))]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "infobi listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        if let Some(warmup) = self.warmup {
            warmup.abort();
        }

        info!("Closing result cache...");
        self.app_state.cache.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
