//! SQL Server execution over TDS.
//!
//! Each statement opens its own session.

use super::columns::{BatchBuilder, Cell, ColumnDescriptor, ColumnKind};
use super::{ExecutionError, QueryExecutor, QueryOutput};
use crate::dialect::Dialect;
use crate::query::{CompiledQuery, SqlParam};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tiberius::{AuthMethod, Client, ColumnData, ColumnType, Config, FromSql, Row, ToSql};
use tokio::net::TcpStream;
use std::time::{Duration, Instant};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, instrument};

/// Executes statements against SQL Server.
pub struct MsSqlExecutor {
    config: Config,
    connect_timeout: Duration,
}

impl MsSqlExecutor {
    pub fn new(host: &str, port: u16, database: &str, username: &str, password: &str, connect_timeout: Duration) -> Self {
        let mut config = Config::new();
        config.host(host);
        config.port(port);
        config.database(database);
        config.authentication(AuthMethod::sql_server(username, password));
        config.trust_cert();
        Self { config, connect_timeout }
    }

    async fn connect(&self) -> Result<Client<Compat<TcpStream>>, ExecutionError> {
        let addr = self.config.get_addr();
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ExecutionError::Connection(format!("timed out connecting to {addr}")))?
            .map_err(|e| ExecutionError::Connection(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| ExecutionError::Connection(e.to_string()))?;
        debug!(%addr, "Opened TDS session");
        Ok(Client::connect(self.config.clone(), tcp.compat_write()).await?)
    }
}

fn column_kind(column_type: ColumnType) -> ColumnKind {
    match column_type {
        ColumnType::Bit | ColumnType::Bitn => ColumnKind::Boolean,
        ColumnType::Int1 | ColumnType::Int2 | ColumnType::Int4 | ColumnType::Int8 | ColumnType::Intn => ColumnKind::Int64,
        ColumnType::Float4
        | ColumnType::Float8
        | ColumnType::Floatn
        | ColumnType::Money
        | ColumnType::Money4
        | ColumnType::Decimaln
        | ColumnType::Numericn => ColumnKind::Float64,
        ColumnType::Daten => ColumnKind::Date32,
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2
        | ColumnType::DatetimeOffsetn => ColumnKind::Timestamp,
        _ => ColumnKind::Utf8,
    }
}

fn decode_cell(data: &ColumnData<'static>) -> Cell {
    match data {
        ColumnData::U8(v) => v.map(i64::from).into(),
        ColumnData::I16(v) => v.map(i64::from).into(),
        ColumnData::I32(v) => v.map(i64::from).into(),
        ColumnData::I64(v) => (*v).into(),
        ColumnData::F32(v) => v.map(f64::from).into(),
        ColumnData::F64(v) => (*v).into(),
        ColumnData::Bit(v) => (*v).into(),
        ColumnData::String(v) => v.as_ref().map(|s| s.to_string()).into(),
        ColumnData::Guid(v) => v.map(|g| g.to_string()).into(),
        ColumnData::Numeric(v) => v.map(f64::from).into(),
        ColumnData::Date(_) => NaiveDate::from_sql(data).ok().flatten().into(),
        ColumnData::Time(_) => NaiveTime::from_sql(data).ok().flatten().map(|t| t.to_string()).into(),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data).ok().flatten().into()
        }
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(data)
            .ok()
            .flatten()
            .map(|ts| ts.naive_utc())
            .into(),
        _ => Cell::Null,
    }
}

fn rows_to_batch(columns: Vec<ColumnDescriptor>, rows: Vec<Row>) -> Result<arrow::record_batch::RecordBatch, ExecutionError> {
    let mut builder = BatchBuilder::new(&columns, rows.len());
    for row in rows {
        builder.append_row(row.into_iter().map(|data| decode_cell(&data)));
    }
    Ok(builder.finish()?)
}

#[async_trait]
impl QueryExecutor for MsSqlExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::MsSql
    }

    #[instrument(skip_all, fields(params = query.params.len()), err)]
    async fn execute(&self, query: &CompiledQuery) -> Result<QueryOutput, ExecutionError> {
        let started = Instant::now();
        let mut client = self.connect().await?;

        let params: Vec<&dyn ToSql> = query
            .params
            .iter()
            .map(|param| match param {
                SqlParam::Text(v) => v as &dyn ToSql,
                SqlParam::Int(v) => v as &dyn ToSql,
                SqlParam::Float(v) => v as &dyn ToSql,
                SqlParam::Bool(v) => v as &dyn ToSql,
            })
            .collect();

        let mut stream = client.query(query.sql.as_str(), &params).await?;
        // Metadata arrives ahead of the rows, so empty results still have a schema
        let columns: Vec<ColumnDescriptor> = stream
            .columns()
            .await?
            .map(|cols| {
                cols.iter()
                    .map(|c| ColumnDescriptor::new(c.name(), column_kind(c.column_type())))
                    .collect()
            })
            .unwrap_or_default();
        let rows = stream.into_first_result().await?;

        let batch = tokio::task::spawn_blocking(move || rows_to_batch(columns, rows)).await??;
        Ok(QueryOutput::new(batch.schema(), vec![batch], started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn test_column_kinds() {
        assert_eq!(column_kind(ColumnType::Intn), ColumnKind::Int64);
        assert_eq!(column_kind(ColumnType::Decimaln), ColumnKind::Float64);
        assert_eq!(column_kind(ColumnType::Datetime2), ColumnKind::Timestamp);
        assert_eq!(column_kind(ColumnType::NVarchar), ColumnKind::Utf8);
    }

    #[test]
    fn test_decode_cells() {
        assert_eq!(decode_cell(&ColumnData::I32(Some(42))), Cell::Int(42));
        assert_eq!(decode_cell(&ColumnData::I32(None)), Cell::Null);
        assert_eq!(
            decode_cell(&ColumnData::String(Some(Cow::Borrowed("Europe")))),
            Cell::Text("Europe".to_string())
        );
        assert_eq!(decode_cell(&ColumnData::Bit(Some(true))), Cell::Bool(true));
    }
}
