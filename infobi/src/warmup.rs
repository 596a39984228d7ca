//! Startup connection warmup.
//!
//! Probes every configured connection once, in parallel, so that pools are filled and
//! misconfigured connections show up in the logs before the first report request. Failures never
//! stop the server.

use crate::catalog::{ConnectionDefinition, ReportCatalog};
use crate::execution::{ExecutionError, ExecutorProvider};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Outcome of one warmup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupSummary {
    pub opened: usize,
    pub failed: usize,
}

async fn probe(backends: &dyn ExecutorProvider, connection: &ConnectionDefinition) -> Result<(), ExecutionError> {
    let executor = backends.executor(connection).await?;
    executor.probe().await
}

/// Probe every connection in the catalog and log the result of each.
#[instrument(skip_all)]
pub async fn warm_up(catalog: &dyn ReportCatalog, backends: &dyn ExecutorProvider) -> WarmupSummary {
    let connections = match catalog.connections().await {
        Ok(connections) => connections,
        Err(e) => {
            warn!(error = %e, "Could not list connections for warmup");
            return WarmupSummary::default();
        }
    };

    let started = Instant::now();
    let results = futures::future::join_all(connections.iter().map(|connection| probe(backends, connection))).await;

    let mut summary = WarmupSummary::default();
    for (connection, result) in connections.iter().zip(results) {
        match result {
            Ok(()) => {
                summary.opened += 1;
                info!(connection_id = connection.id, name = %connection.name, dialect = %connection.dialect, "Connection OPEN");
            }
            Err(e) => {
                summary.failed += 1;
                warn!(connection_id = connection.id, name = %connection.name, error = %e, "Connection FAIL");
            }
        }
    }

    info!(
        opened = summary.opened,
        failed = summary.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Connection warmup finished"
    );
    summary
}

/// Run [`warm_up`] in the background.
pub fn spawn_warmup(catalog: Arc<dyn ReportCatalog>, backends: Arc<dyn ExecutorProvider>) -> JoinHandle<WarmupSummary> {
    tokio::spawn(async move { warm_up(catalog.as_ref(), backends.as_ref()).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::dialect::Dialect;
    use crate::test_utils::{StubProvider, create_test_connection};

    fn catalog() -> Arc<StaticCatalog> {
        let mut second = create_test_connection(Dialect::Postgres);
        second.id = 2;
        second.name = "archive".to_string();
        Arc::new(StaticCatalog::new(vec![create_test_connection(Dialect::Postgres), second], Vec::new()))
    }

    #[test_log::test(tokio::test)]
    async fn test_warmup_probes_every_connection() {
        let provider = Arc::new(StubProvider::new(Dialect::Postgres));
        let summary = spawn_warmup(catalog(), provider.clone()).await.unwrap();

        assert_eq!(summary, WarmupSummary { opened: 2, failed: 0 });
        let executed = provider.executed();
        assert_eq!(executed.len(), 2);
        assert!(executed.iter().all(|q| q.sql == "SELECT 1"));
    }

    #[test_log::test(tokio::test)]
    async fn test_warmup_failures_are_counted() {
        let provider = Arc::new(StubProvider::new(Dialect::Postgres));
        provider.fail_probes();
        let summary = warm_up(catalog().as_ref(), provider.as_ref()).await;
        assert_eq!(summary, WarmupSummary { opened: 0, failed: 2 });
    }
}
