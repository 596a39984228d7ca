//! Test utilities for integration testing (available with `test-utils` feature).
//!
//! [`StubProvider`] stands in for real backends: every connection gets a [`StubExecutor`] that
//! records the statements it is asked to run and answers from a queue of canned responses.

use crate::api::models::pivot::MetricDefinition;
use crate::api::models::query::AggregateFunction;
use crate::cache::ResultCache;
use crate::catalog::{ConnectionDefinition, ReportDefinition};
use crate::config::Config;
use crate::dialect::Dialect;
use crate::execution::columns::{BatchBuilder, Cell, ColumnDescriptor};
use crate::execution::{ExecutionError, ExecutorProvider, QueryExecutor, QueryOutput};
use crate::query::CompiledQuery;
use async_trait::async_trait;
use axum_test::TestServer;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A canned answer for one statement.
#[derive(Debug, Clone)]
pub enum StubResponse {
    Rows(QueryOutput),
    Failure(String),
}

impl StubResponse {
    pub fn rows(columns: Vec<ColumnDescriptor>, rows: Vec<Vec<Cell>>) -> Self {
        let mut builder = BatchBuilder::new(&columns, rows.len());
        for row in rows {
            builder.append_row(row);
        }
        let schema = builder.schema();
        let batch = builder.finish().expect("stub rows must match their columns");
        StubResponse::Rows(QueryOutput::new(schema, vec![batch], Duration::from_millis(1)))
    }

    /// The backend rejects the statement with `message`.
    pub fn failure(message: impl Into<String>) -> Self {
        StubResponse::Failure(message.into())
    }

    fn into_result(self) -> Result<QueryOutput, ExecutionError> {
        match self {
            StubResponse::Rows(output) => Ok(output),
            StubResponse::Failure(message) => Err(ExecutionError::Backend(message)),
        }
    }
}

#[derive(Default)]
struct StubState {
    /// Responses reserved for statements containing a fragment, consumed first
    matched: Vec<(String, StubResponse)>,
    queue: VecDeque<StubResponse>,
    executed: Vec<CompiledQuery>,
    probes_fail: bool,
}

pub struct StubExecutor {
    dialect: Dialect,
    state: Arc<Mutex<StubState>>,
}

#[async_trait]
impl QueryExecutor for StubExecutor {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, query: &CompiledQuery) -> Result<QueryOutput, ExecutionError> {
        let mut state = self.state.lock().expect("stub state poisoned");
        state.executed.push(query.clone());

        if query.sql == self.dialect.probe_sql() {
            return if state.probes_fail {
                Err(ExecutionError::Connection("stub backend unreachable".to_string()))
            } else {
                Ok(QueryOutput::new(Arc::new(arrow::datatypes::Schema::empty()), Vec::new(), Duration::ZERO))
            };
        }

        if let Some(index) = state.matched.iter().position(|(fragment, _)| query.sql.contains(fragment.as_str())) {
            return state.matched.remove(index).1.into_result();
        }
        state
            .queue
            .pop_front()
            .unwrap_or_else(|| StubResponse::failure(format!("no stub response queued for: {}", query.sql)))
            .into_result()
    }
}

/// Hands every connection an executor sharing one response queue and statement log.
pub struct StubProvider {
    dialect: Dialect,
    state: Arc<Mutex<StubState>>,
}

impl StubProvider {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: Arc::default(),
        }
    }

    /// Queue a response for the next statement without a matching fragment.
    pub fn push(&self, response: StubResponse) {
        self.state.lock().expect("stub state poisoned").queue.push_back(response);
    }

    /// Reserve a response for the first statement whose SQL contains `fragment`.
    pub fn push_for(&self, fragment: &str, response: StubResponse) {
        self.state
            .lock()
            .expect("stub state poisoned")
            .matched
            .push((fragment.to_string(), response));
    }

    /// Make liveness probes fail.
    pub fn fail_probes(&self) {
        self.state.lock().expect("stub state poisoned").probes_fail = true;
    }

    /// Every statement executed so far, in order.
    pub fn executed(&self) -> Vec<CompiledQuery> {
        self.state.lock().expect("stub state poisoned").executed.clone()
    }
}

#[async_trait]
impl ExecutorProvider for StubProvider {
    async fn executor(&self, _connection: &ConnectionDefinition) -> Result<Arc<dyn QueryExecutor>, ExecutionError> {
        Ok(Arc::new(StubExecutor {
            dialect: self.dialect,
            state: self.state.clone(),
        }))
    }
}

pub fn create_test_connection(dialect: Dialect) -> ConnectionDefinition {
    ConnectionDefinition {
        id: 1,
        name: "warehouse".to_string(),
        dialect,
        host: "localhost".to_string(),
        port: None,
        database: "sales".to_string(),
        username: "reader".to_string(),
        password: Some("secret".to_string()),
        password_encrypted: None,
    }
}

pub fn create_test_report() -> ReportDefinition {
    ReportDefinition {
        id: 1,
        name: "Sales by region".to_string(),
        connection_id: 1,
        query: "SELECT Region, Country, Sales, Venduto, Costo FROM sales_facts".to_string(),
        default_group_by: vec!["Region".to_string()],
        default_metrics: vec![MetricDefinition::aggregate("Sales", "Sales", AggregateFunction::Sum)],
        available_metrics: vec![MetricDefinition::margin("MarginePerc", "Venduto", "Costo")],
        column_labels: BTreeMap::from([("Region".to_string(), "Area".to_string())]),
        cache_enabled: true,
        cache_ttl: None,
    }
}

pub fn create_test_config(dialect: Dialect) -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        connections: vec![create_test_connection(dialect)],
        reports: vec![create_test_report()],
        ..Default::default()
    };
    config.cache.max_capacity_mb = 16;
    config.engine.warmup_on_start = false;
    config
}

/// A test server over the full router, with backends replaced by `provider`.
pub fn create_test_app(provider: Arc<StubProvider>) -> TestServer {
    let config = create_test_config(provider.dialect);
    let cache = ResultCache::from_config(&config.cache);
    crate::Application::with_components(config, provider, cache)
        .expect("Failed to create application")
        .into_test_server()
}
