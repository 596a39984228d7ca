use super::mssql::MsSqlExecutor;
use super::mysql::MySqlExecutor;
use super::postgres::PostgresExecutor;
use super::{ExecutionError, ExecutorProvider, QueryExecutor};
use crate::catalog::ConnectionDefinition;
use crate::crypto;
use crate::dialect::Dialect;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Sizing for per-connection pools.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Creates executors on first use and reuses them per connection id.
///
/// PostgreSQL and MySQL pools are built lazily, so nothing is dialed until the first statement.
pub struct BackendPool {
    settings: PoolSettings,
    encryption_key: Option<String>,
    executors: DashMap<i64, Arc<dyn QueryExecutor>>,
}

impl BackendPool {
    pub fn new(settings: PoolSettings, encryption_key: Option<String>) -> Self {
        Self {
            settings,
            encryption_key,
            executors: DashMap::new(),
        }
    }

    fn password(&self, connection: &ConnectionDefinition) -> Result<String, ExecutionError> {
        match (&connection.password_encrypted, &connection.password) {
            (Some(encrypted), _) => {
                let key = self.encryption_key.as_deref().ok_or_else(|| {
                    ExecutionError::Connection(format!(
                        "connection '{}' has an encrypted password but no encryption key is configured",
                        connection.name
                    ))
                })?;
                crypto::decrypt_password(key, encrypted)
                    .map_err(|e| ExecutionError::Connection(format!("failed to decrypt password: {e}")))
            }
            (None, Some(password)) => Ok(password.clone()),
            (None, None) => Ok(String::new()),
        }
    }

    fn build(&self, connection: &ConnectionDefinition) -> Result<Arc<dyn QueryExecutor>, ExecutionError> {
        let password = self.password(connection)?;
        let executor: Arc<dyn QueryExecutor> = match connection.dialect {
            Dialect::Postgres => {
                let url = connection_url(connection, &password)?;
                let pool = PgPoolOptions::new()
                    .max_connections(self.settings.max_connections)
                    .acquire_timeout(self.settings.acquire_timeout)
                    .connect_lazy(&url)?;
                Arc::new(PostgresExecutor::new(pool))
            }
            Dialect::MySql => {
                let url = connection_url(connection, &password)?;
                let pool = MySqlPoolOptions::new()
                    .max_connections(self.settings.max_connections)
                    .acquire_timeout(self.settings.acquire_timeout)
                    .connect_lazy(&url)?;
                Arc::new(MySqlExecutor::new(pool))
            }
            Dialect::MsSql => Arc::new(MsSqlExecutor::new(
                &connection.host,
                connection.port(),
                &connection.database,
                &connection.username,
                &password,
                self.settings.acquire_timeout,
            )),
        };
        debug!(connection_id = connection.id, dialect = %connection.dialect, "Created executor");
        Ok(executor)
    }
}

fn connection_url(connection: &ConnectionDefinition, password: &str) -> Result<String, ExecutionError> {
    connection
        .dialect
        .connection_string(&connection.params(password))
        .map_err(|e| ExecutionError::Connection(e.to_string()))
}

#[async_trait]
impl ExecutorProvider for BackendPool {
    #[instrument(skip_all, fields(connection_id = connection.id))]
    async fn executor(&self, connection: &ConnectionDefinition) -> Result<Arc<dyn QueryExecutor>, ExecutionError> {
        if let Some(existing) = self.executors.get(&connection.id) {
            return Ok(existing.value().clone());
        }
        let entry = self
            .executors
            .entry(connection.id)
            .or_try_insert_with(|| self.build(connection))?;
        Ok(entry.value().clone())
    }
}
