use super::columns::{BatchBuilder, Cell};
use super::{ExecutionError, QueryExecutor, QueryOutput, describe_columns};
use crate::dialect::Dialect;
use crate::query::{CompiledQuery, SqlParam};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use sqlx::postgres::{PgArguments, PgPool, PgRow, PgTypeInfo, PgTypeKind};
use sqlx::query::Query;
use sqlx::{Column, Either, Executor, Postgres, Row, Statement, TypeInfo, ValueRef};
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

/// Executes statements on a PostgreSQL pool.
///
/// Parameterized statements are prepared first with every parameter type left unspecified, so the
/// server infers each placeholder's type from the column it is compared with (exactly as it does
/// for an untyped quoted literal). Values are then converted to those types before binding.
pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// A parameter value in the type Postgres inferred for its placeholder.
#[derive(Debug, Clone, PartialEq)]
enum PgParam {
    Text(String),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Bool(bool),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
}

fn invalid(value: &str, type_name: &str) -> ExecutionError {
    ExecutionError::InvalidParameter {
        value: value.to_string(),
        type_name: type_name.to_ascii_lowercase(),
    }
}

fn parse_integer(param: &SqlParam, type_name: &str) -> Result<i64, ExecutionError> {
    match param {
        SqlParam::Int(i) => Ok(*i),
        SqlParam::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
        other => {
            let text = other.as_text();
            text.trim().parse::<i64>().map_err(|_| invalid(&text, type_name))
        }
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// Convert `param` to the type inferred for its placeholder. Types without a conversion keep the
/// text form, which Postgres reads through the type's own input routine.
fn typed_param(param: &SqlParam, type_name: &str) -> Result<PgParam, ExecutionError> {
    let text = param.as_text();
    let trimmed = text.trim();
    let typed = match type_name {
        "INT2" => PgParam::Int2(i16::try_from(parse_integer(param, type_name)?).map_err(|_| invalid(&text, type_name))?),
        "INT4" => PgParam::Int4(i32::try_from(parse_integer(param, type_name)?).map_err(|_| invalid(&text, type_name))?),
        "INT8" => PgParam::Int8(parse_integer(param, type_name)?),
        "FLOAT4" => PgParam::Float4(trimmed.parse::<f32>().map_err(|_| invalid(&text, type_name))?),
        "FLOAT8" => PgParam::Float8(trimmed.parse::<f64>().map_err(|_| invalid(&text, type_name))?),
        "NUMERIC" => PgParam::Numeric(
            trimmed
                .parse::<Decimal>()
                .or_else(|_| Decimal::from_scientific(trimmed))
                .map_err(|_| invalid(&text, type_name))?,
        ),
        "BOOL" => PgParam::Bool(match trimmed.to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => true,
            "f" | "false" | "n" | "no" | "off" | "0" => false,
            _ => return Err(invalid(&text, type_name)),
        }),
        "DATE" => PgParam::Date(
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .or_else(|| parse_timestamp(trimmed).map(|ts| ts.date()))
                .ok_or_else(|| invalid(&text, type_name))?,
        ),
        "TIME" => PgParam::Time(
            NaiveTime::parse_from_str(trimmed, "%H:%M:%S%.f")
                .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
                .map_err(|_| invalid(&text, type_name))?,
        ),
        "TIMESTAMP" => PgParam::Timestamp(parse_timestamp(trimmed).ok_or_else(|| invalid(&text, type_name))?),
        "TIMESTAMPTZ" => PgParam::TimestampTz(
            DateTime::parse_from_rfc3339(trimmed)
                .map(|ts| ts.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_timestamp(trimmed).map(|ts| ts.and_utc()))
                .ok_or_else(|| invalid(&text, type_name))?,
        ),
        "UUID" => PgParam::Uuid(Uuid::parse_str(trimmed).map_err(|_| invalid(&text, type_name))?),
        _ => PgParam::Text(text),
    };
    Ok(typed)
}

/// Pair every parameter with the type the server inferred for it.
fn typed_params(params: &[SqlParam], inferred: &[PgTypeInfo]) -> Result<Vec<PgParam>, ExecutionError> {
    if params.len() != inferred.len() {
        return Err(ExecutionError::Backend(format!(
            "statement expects {} parameters, {} were bound",
            inferred.len(),
            params.len()
        )));
    }
    params
        .iter()
        .zip(inferred)
        .map(|(param, ty)| typed_param(param, ty.name()))
        .collect()
}

fn bind_params(mut query: Query<'_, Postgres, PgArguments>, params: Vec<PgParam>) -> Query<'_, Postgres, PgArguments> {
    for param in params {
        query = match param {
            PgParam::Text(v) => query.bind(v),
            PgParam::Int2(v) => query.bind(v),
            PgParam::Int4(v) => query.bind(v),
            PgParam::Int8(v) => query.bind(v),
            PgParam::Float4(v) => query.bind(v),
            PgParam::Float8(v) => query.bind(v),
            PgParam::Numeric(v) => query.bind(v),
            PgParam::Bool(v) => query.bind(v),
            PgParam::Date(v) => query.bind(v),
            PgParam::Time(v) => query.bind(v),
            PgParam::Timestamp(v) => query.bind(v),
            PgParam::TimestampTz(v) => query.bind(v),
            PgParam::Uuid(v) => query.bind(v),
        };
    }
    query
}

fn decode_cell(row: &PgRow, index: usize, type_info: &PgTypeInfo) -> Result<Cell, ExecutionError> {
    let cell = match type_info.name() {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(i64::from).into(),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(i64::from).into(),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.into(),
        "NUMERIC" => row.try_get::<Option<Decimal>, _>(index)?.and_then(|d| d.to_f64()).into(),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.into(),
        "TIME" => row.try_get::<Option<NaiveTime>, _>(index)?.map(|t| t.to_string()).into(),
        "TIMESTAMP" => row.try_get::<Option<NaiveDateTime>, _>(index)?.into(),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|ts| ts.naive_utc())
            .into(),
        "UUID" => row.try_get::<Option<Uuid>, _>(index)?.map(|u| u.to_string()).into(),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(|v| v.to_string())
            .into(),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" | "citext" => row.try_get::<Option<String>, _>(index)?.into(),
        // Enum labels travel as their text even in binary results
        _ if matches!(type_info.kind(), PgTypeKind::Enum(_)) => {
            let raw = row.try_get_raw(index)?;
            if raw.is_null() {
                Cell::Null
            } else {
                Cell::Text(raw.as_str().map_err(sqlx::Error::Decode)?.to_string())
            }
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

fn rows_to_batch(rows: Vec<PgRow>) -> Result<BatchBuilder, ExecutionError> {
    let Some(first) = rows.first() else {
        return Ok(BatchBuilder::new(&[], 0));
    };
    let columns = describe_columns(first.columns());
    let types: Vec<PgTypeInfo> = first.columns().iter().map(|c| c.type_info().clone()).collect();

    let mut builder = BatchBuilder::new(&columns, rows.len());
    for row in &rows {
        let cells = types
            .iter()
            .enumerate()
            .map(|(index, type_info)| decode_cell(row, index, type_info))
            .collect::<Result<Vec<_>, _>>()?;
        builder.append_row(cells);
    }
    Ok(builder)
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    #[instrument(skip_all, fields(params = query.params.len()), err)]
    async fn execute(&self, query: &CompiledQuery) -> Result<QueryOutput, ExecutionError> {
        let started = Instant::now();
        let mut conn = self.pool.acquire().await?;

        // Prepared on the connection that runs it, so the bind below reuses the cached statement
        let statement = (&mut *conn).prepare(&query.sql).await?;
        let inferred = match statement.parameters() {
            Some(Either::Left(types)) => types.to_vec(),
            _ => Vec::new(),
        };
        let params = typed_params(&query.params, &inferred)?;

        let rows = bind_params(sqlx::query(&query.sql), params).fetch_all(&mut *conn).await?;

        let batch = if rows.is_empty() {
            BatchBuilder::new(&describe_columns(statement.columns()), 0).finish()?
        } else {
            tokio::task::spawn_blocking(move || rows_to_batch(rows)?.finish().map_err(ExecutionError::from)).await??
        };

        Ok(QueryOutput::new(batch.schema(), vec![batch], started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::grid::PivotDrillRequest;
    use crate::api::models::pivot::{MetricDefinition, PivotRequest};
    use crate::api::models::query::{AggregateFunction, ColumnFilter, FilterOperator};
    use crate::query::drill::compile_drill;
    use crate::query::pivot::compile_pivot;
    use serde_json::json;

    fn typed(param: SqlParam, type_info: PgTypeInfo) -> Result<PgParam, ExecutionError> {
        typed_param(&param, type_info.name())
    }

    #[test]
    fn test_text_values_follow_inferred_types() {
        assert_eq!(
            typed(SqlParam::Text("2024".into()), PgTypeInfo::with_name("INT4")).unwrap(),
            PgParam::Int4(2024)
        );
        assert_eq!(
            typed(SqlParam::Text("2023-03-01".into()), PgTypeInfo::with_name("DATE")).unwrap(),
            PgParam::Date(NaiveDate::from_ymd_opt(2023, 3, 1).unwrap())
        );
        assert_eq!(
            typed(SqlParam::Text("2023-03-01T10:30:00".into()), PgTypeInfo::with_name("TIMESTAMP")).unwrap(),
            PgParam::Timestamp(NaiveDate::from_ymd_opt(2023, 3, 1).unwrap().and_hms_opt(10, 30, 0).unwrap())
        );
        assert_eq!(
            typed(SqlParam::Text("12.50".into()), PgTypeInfo::with_name("NUMERIC")).unwrap(),
            PgParam::Numeric(Decimal::new(1250, 2))
        );
        assert_eq!(
            typed(SqlParam::Text("Europe".into()), PgTypeInfo::with_name("VARCHAR")).unwrap(),
            PgParam::Text("Europe".into())
        );
    }

    #[test]
    fn test_numbers_follow_inferred_types() {
        assert_eq!(typed(SqlParam::Int(7), PgTypeInfo::with_name("INT2")).unwrap(), PgParam::Int2(7));
        assert_eq!(typed(SqlParam::Int(7), PgTypeInfo::with_name("FLOAT8")).unwrap(), PgParam::Float8(7.0));
        assert_eq!(typed(SqlParam::Float(3.0), PgTypeInfo::with_name("INT8")).unwrap(), PgParam::Int8(3));
        assert_eq!(typed(SqlParam::Int(7), PgTypeInfo::with_name("TEXT")).unwrap(), PgParam::Text("7".into()));
    }

    #[test]
    fn test_unparseable_values_are_rejected() {
        let err = typed(SqlParam::Text("abc".into()), PgTypeInfo::with_name("INT4")).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidParameter { .. }));
        assert!(typed(SqlParam::Float(2.5), PgTypeInfo::with_name("INT4")).is_err());
        assert!(typed(SqlParam::Int(70_000), PgTypeInfo::with_name("INT2")).is_err());
        assert!(typed(SqlParam::Text("yesterday".into()), PgTypeInfo::with_name("DATE")).is_err());
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let err = typed_params(&[SqlParam::Int(1)], &[]).unwrap_err();
        assert!(matches!(err, ExecutionError::Backend(_)));
    }

    /// Runs against a live server when `INFOBI_TEST_POSTGRES_URL` is set.
    #[tokio::test]
    async fn test_filters_and_drill_keys_against_typed_columns() {
        let Ok(url) = std::env::var("INFOBI_TEST_POSTGRES_URL") else {
            return;
        };
        let pool = PgPool::connect(&url).await.unwrap();
        let executor = PostgresExecutor::new(pool);
        let base = "SELECT * FROM (VALUES ('Europe', 2024, DATE '2023-03-01', 10.0), ('Asia', 2023, DATE '2023-04-01', 5.0)) \
                    AS s(\"Region\", \"Year\", \"Day\", \"Sales\")";

        let mut pivot = PivotRequest {
            group_by: vec!["Region".to_string()],
            metrics: vec![MetricDefinition::aggregate("Sales", "Sales", AggregateFunction::Sum)],
            ..Default::default()
        };
        pivot
            .filters
            .insert("Year".to_string(), ColumnFilter::new(FilterOperator::Equals, "2024"));
        pivot
            .filters
            .insert("Day".to_string(), ColumnFilter::new(FilterOperator::GreaterThan, "2023-01-01"));
        let output = executor
            .execute(&compile_pivot(base, &pivot, Dialect::Postgres).unwrap())
            .await
            .unwrap();
        assert_eq!(output.row_count, 1);

        let root = PivotDrillRequest {
            row_group_cols: vec!["Day".to_string(), "Region".to_string()],
            ..Default::default()
        };
        let days = executor
            .execute(&compile_drill(base, &root, Dialect::Postgres).unwrap().unwrap())
            .await
            .unwrap();
        let keys = crate::serialization::batches_to_json_rows(&days.batches).unwrap();
        let first_day = keys[0]["Day"].clone();
        assert_eq!(first_day, json!("2023-03-01"));

        let child = PivotDrillRequest {
            group_keys: vec![first_day],
            ..root
        };
        let regions = executor
            .execute(&compile_drill(base, &child, Dialect::Postgres).unwrap().unwrap())
            .await
            .unwrap();
        assert_eq!(regions.row_count, 1);
    }

    /// Runs against a live server when `INFOBI_TEST_POSTGRES_URL` is set.
    #[tokio::test]
    async fn test_time_and_json_decode_and_interval_is_rejected() {
        let Ok(url) = std::env::var("INFOBI_TEST_POSTGRES_URL") else {
            return;
        };
        let executor = PostgresExecutor::new(PgPool::connect(&url).await.unwrap());

        let output = executor
            .execute(&CompiledQuery::raw("SELECT '12:30'::time AS t, '{\"a\":1}'::jsonb AS j"))
            .await
            .unwrap();
        let rows = crate::serialization::batches_to_json_rows(&output.batches).unwrap();
        assert_eq!(rows[0]["t"], json!("12:30:00"));
        assert_eq!(rows[0]["j"], json!("{\"a\":1}"));

        let err = executor
            .execute(&CompiledQuery::raw("SELECT interval '1 day' AS i"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::UnsupportedType { ref column, .. } if column == "i"));
    }
}
