use super::columns::{BatchBuilder, Cell};
use super::{ExecutionError, QueryExecutor, QueryOutput, describe_columns};
use crate::dialect::Dialect;
use crate::query::{CompiledQuery, SqlParam};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Executor, MySql, Row, Statement, TypeInfo};
use std::time::Instant;
use tracing::instrument;

/// Executes statements on a MySQL pool.
pub struct MySqlExecutor {
    pool: MySqlPool,
}

impl MySqlExecutor {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn bind_params<'q>(mut query: Query<'q, MySql, MySqlArguments>, params: &'q [SqlParam]) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Float(v) => query.bind(*v),
            SqlParam::Bool(v) => query.bind(*v),
        };
    }
    query
}

fn unsigned_cell(value: u64) -> Cell {
    match i64::try_from(value) {
        Ok(v) => Cell::Int(v),
        Err(_) => Cell::Float(value as f64),
    }
}

fn decode_cell(row: &MySqlRow, index: usize, type_name: &str) -> Result<Cell, ExecutionError> {
    let cell = match type_name {
        "BOOLEAN" => row.try_get::<Option<bool>, _>(index)?.into(),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => row.try_get::<Option<i64>, _>(index)?.into(),
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED" | "BIGINT UNSIGNED" | "YEAR" => {
            row.try_get::<Option<u64>, _>(index)?.map_or(Cell::Null, unsigned_cell)
        }
        "FLOAT" => row.try_get::<Option<f32>, _>(index)?.map(f64::from).into(),
        "DOUBLE" => row.try_get::<Option<f64>, _>(index)?.into(),
        "NULL" => Cell::Null,
        "DECIMAL" => row.try_get::<Option<Decimal>, _>(index)?.and_then(|d| d.to_f64()).into(),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.into(),
        "DATETIME" => row.try_get::<Option<NaiveDateTime>, _>(index)?.into(),
        "TIMESTAMP" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|ts| ts.naive_utc())
            .into(),
        "TIME" => row.try_get::<Option<NaiveTime>, _>(index)?.map(|t| t.to_string()).into(),
        "JSON" => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(|v| v.to_string())
            .into(),
        "CHAR" | "VARCHAR" | "TINYTEXT" | "TEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET" => {
            row.try_get::<Option<String>, _>(index)?.into()
        }
        other => {
            return Err(ExecutionError::UnsupportedType {
                column: row.columns()[index].name().to_string(),
                type_name: other.to_string(),
            });
        }
    };
    Ok(cell)
}

fn rows_to_batch(rows: Vec<MySqlRow>) -> Result<BatchBuilder, ExecutionError> {
    let Some(first) = rows.first() else {
        return Ok(BatchBuilder::new(&[], 0));
    };
    let columns = describe_columns(first.columns());
    let type_names: Vec<String> = first.columns().iter().map(|c| c.type_info().name().to_string()).collect();

    let mut builder = BatchBuilder::new(&columns, rows.len());
    for row in &rows {
        let cells = type_names
            .iter()
            .enumerate()
            .map(|(index, type_name)| decode_cell(row, index, type_name))
            .collect::<Result<Vec<_>, _>>()?;
        builder.append_row(cells);
    }
    Ok(builder)
}

#[async_trait]
impl QueryExecutor for MySqlExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    #[instrument(skip_all, fields(params = query.params.len()), err)]
    async fn execute(&self, query: &CompiledQuery) -> Result<QueryOutput, ExecutionError> {
        let started = Instant::now();
        let rows = bind_params(sqlx::query(&query.sql), &query.params)
            .fetch_all(&self.pool)
            .await?;

        let batch = if rows.is_empty() {
            let statement = (&self.pool).prepare(&query.sql).await?;
            BatchBuilder::new(&describe_columns(statement.columns()), 0).finish()?
        } else {
            tokio::task::spawn_blocking(move || rows_to_batch(rows)?.finish().map_err(ExecutionError::from)).await??
        };

        Ok(QueryOutput::new(batch.schema(), vec![batch], started.elapsed()))
    }
}
