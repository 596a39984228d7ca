//! Statement execution against report backends.
//!
//! A [`QueryExecutor`] runs one [`CompiledQuery`] and returns its rows as Arrow record batches.
//! Each call is a single attempt: failures surface as [`ExecutionError`] carrying the backend's
//! own message and nothing is retried. Converting rows to columns is CPU work and runs on the
//! blocking pool so it never stalls the async workers.
//!
//! Executors are obtained per connection through an [`ExecutorProvider`]; the shipped
//! [`pool::BackendPool`] keeps one lazily connected pool per PostgreSQL/MySQL connection and opens
//! a fresh TDS session per statement for SQL Server.

pub mod columns;
pub mod mssql;
pub mod mysql;
pub mod pool;
pub mod postgres;

use crate::catalog::ConnectionDefinition;
use crate::execution::columns::{ColumnDescriptor, ColumnKind};
use crate::dialect::Dialect;
use crate::query::CompiledQuery;
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;

pub use pool::BackendPool;

#[derive(ThisError, Debug)]
pub enum ExecutionError {
    /// The backend rejected or failed the statement; the message is the backend's own text
    #[error("{0}")]
    Backend(String),

    /// Could not reach or authenticate against the backend
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The result holds a column type with no column representation
    #[error("Column '{column}' has unsupported type {type_name}")]
    UnsupportedType { column: String, type_name: String },

    /// A bound value does not parse as the type its placeholder compares against
    #[error("Invalid value '{value}' for a {type_name} comparison")]
    InvalidParameter { value: String, type_name: String },

    /// Rows could not be converted or encoded
    #[error("Failed to encode result set: {0}")]
    Encoding(#[from] ArrowError),

    /// The blocking conversion task panicked or was cancelled
    #[error("Result conversion task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Result of one statement.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub row_count: usize,
    pub elapsed: Duration,
}

impl QueryOutput {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>, elapsed: Duration) -> Self {
        let row_count = batches.iter().map(RecordBatch::num_rows).sum();
        Self {
            schema,
            batches,
            row_count,
            elapsed,
        }
    }
}

/// Column descriptors from sqlx column metadata.
pub(crate) fn describe_columns<C: sqlx::Column>(columns: &[C]) -> Vec<ColumnDescriptor> {
    use sqlx::TypeInfo;
    columns
        .iter()
        .map(|c| ColumnDescriptor::new(c.name(), ColumnKind::from_type_name(c.type_info().name())))
        .collect()
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn execute(&self, query: &CompiledQuery) -> Result<QueryOutput, ExecutionError>;

    /// Run the dialect's liveness statement.
    async fn probe(&self) -> Result<(), ExecutionError> {
        self.execute(&CompiledQuery::raw(self.dialect().probe_sql())).await.map(|_| ())
    }
}

/// Hands out the executor for a configured connection.
#[async_trait]
pub trait ExecutorProvider: Send + Sync {
    async fn executor(&self, connection: &ConnectionDefinition) -> Result<Arc<dyn QueryExecutor>, ExecutionError>;
}

impl From<sqlx::Error> for ExecutionError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => ExecutionError::Backend(db_err.message().to_string()),
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                ExecutionError::Connection(err.to_string())
            }
            other => ExecutionError::Backend(other.to_string()),
        }
    }
}

impl From<tiberius::error::Error> for ExecutionError {
    fn from(err: tiberius::error::Error) -> Self {
        match err {
            tiberius::error::Error::Server(token) => ExecutionError::Backend(token.message().to_string()),
            tiberius::error::Error::Io { .. } | tiberius::error::Error::Tls(_) | tiberius::error::Error::Routing { .. } => {
                ExecutionError::Connection(err.to_string())
            }
            other => ExecutionError::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::columns::{BatchBuilder, Cell};

    #[test]
    fn test_row_count_sums_batches() {
        let columns = vec![ColumnDescriptor::new("n", ColumnKind::Int64)];
        let mut first = BatchBuilder::new(&columns, 2);
        first.append_row([Cell::Int(1)]);
        first.append_row([Cell::Int(2)]);
        let mut second = BatchBuilder::new(&columns, 1);
        second.append_row([Cell::Int(3)]);
        let schema = first.schema();

        let output = QueryOutput::new(
            schema,
            vec![first.finish().unwrap(), second.finish().unwrap()],
            Duration::from_millis(5),
        );
        assert_eq!(output.row_count, 3);
    }

    #[test]
    fn test_pool_timeout_is_a_connection_error() {
        let err = ExecutionError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, ExecutionError::Connection(_)));
    }
}
