//! Row to column conversion.
//!
//! Backends decode each value into a [`Cell`]; a [`BatchBuilder`] appends cells into typed Arrow
//! builders chosen from the result's column types. Decimals are widened to `Float64` so every
//! numeric aggregate arrives at the client as a plain number.

use arrow::array::{
    ArrayRef, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;

/// Arrow representation chosen for a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Date32,
    Timestamp,
}

impl ColumnKind {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnKind::Boolean => DataType::Boolean,
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Utf8 => DataType::Utf8,
            ColumnKind::Date32 => DataType::Date32,
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }

    /// Map a backend type name (as reported by sqlx for Postgres and MySQL) to a column kind.
    pub fn from_type_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        let base = upper.trim_end_matches(" UNSIGNED");
        match base {
            "BOOL" | "BOOLEAN" => ColumnKind::Boolean,
            "INT2" | "INT4" | "INT8" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "YEAR" => ColumnKind::Int64,
            "FLOAT4" | "FLOAT8" | "FLOAT" | "DOUBLE" | "REAL" | "NUMERIC" | "DECIMAL" => ColumnKind::Float64,
            "DATE" => ColumnKind::Date32,
            "TIMESTAMP" | "TIMESTAMPTZ" | "DATETIME" => ColumnKind::Timestamp,
            _ => ColumnKind::Utf8,
        }
    }
}

/// A single decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map_or(Cell::Null, Into::into)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<NaiveDate> for Cell {
    fn from(value: NaiveDate) -> Self {
        Cell::Date(value)
    }
}

impl From<NaiveDateTime> for Cell {
    fn from(value: NaiveDateTime) -> Self {
        Cell::Timestamp(value)
    }
}

/// Name and kind of a result column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self { name: name.into(), kind }
    }
}

pub fn schema_for(columns: &[ColumnDescriptor]) -> SchemaRef {
    Arc::new(Schema::new(
        columns
            .iter()
            .map(|c| Field::new(&c.name, c.kind.data_type(), true))
            .collect::<Vec<_>>(),
    ))
}

enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int64(Int64Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
    Date32(Date32Builder),
    Timestamp(TimestampMicrosecondBuilder),
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    // NaiveDate::default() is 1970-01-01
    date.signed_duration_since(NaiveDate::default()).num_days() as i32
}

impl ColumnBuilder {
    fn new(kind: ColumnKind, capacity: usize) -> Self {
        match kind {
            ColumnKind::Boolean => ColumnBuilder::Boolean(BooleanBuilder::with_capacity(capacity)),
            ColumnKind::Int64 => ColumnBuilder::Int64(Int64Builder::with_capacity(capacity)),
            ColumnKind::Float64 => ColumnBuilder::Float64(Float64Builder::with_capacity(capacity)),
            ColumnKind::Utf8 => ColumnBuilder::Utf8(StringBuilder::with_capacity(capacity, capacity * 16)),
            ColumnKind::Date32 => ColumnBuilder::Date32(Date32Builder::with_capacity(capacity)),
            ColumnKind::Timestamp => ColumnBuilder::Timestamp(TimestampMicrosecondBuilder::with_capacity(capacity)),
        }
    }

    /// Append a cell, converting between compatible representations; anything that does not fit
    /// the column becomes null.
    fn append(&mut self, cell: Cell) {
        match self {
            ColumnBuilder::Boolean(b) => match cell {
                Cell::Bool(v) => b.append_value(v),
                Cell::Int(v) => b.append_value(v != 0),
                _ => b.append_null(),
            },
            ColumnBuilder::Int64(b) => match cell {
                Cell::Int(v) => b.append_value(v),
                Cell::Bool(v) => b.append_value(v as i64),
                Cell::Float(v) if v.fract() == 0.0 && v.is_finite() => b.append_value(v as i64),
                Cell::Text(v) => b.append_option(v.trim().parse::<i64>().ok()),
                _ => b.append_null(),
            },
            ColumnBuilder::Float64(b) => match cell {
                Cell::Float(v) => b.append_value(v),
                Cell::Int(v) => b.append_value(v as f64),
                Cell::Text(v) => b.append_option(v.trim().parse::<f64>().ok()),
                _ => b.append_null(),
            },
            ColumnBuilder::Utf8(b) => match cell {
                Cell::Null => b.append_null(),
                Cell::Text(v) => b.append_value(v),
                Cell::Bool(v) => b.append_value(v.to_string()),
                Cell::Int(v) => b.append_value(v.to_string()),
                Cell::Float(v) => b.append_value(v.to_string()),
                Cell::Date(v) => b.append_value(v.to_string()),
                Cell::Timestamp(v) => b.append_value(v.to_string()),
            },
            ColumnBuilder::Date32(b) => match cell {
                Cell::Date(v) => b.append_value(days_since_epoch(v)),
                Cell::Timestamp(v) => b.append_value(days_since_epoch(v.date())),
                _ => b.append_null(),
            },
            ColumnBuilder::Timestamp(b) => match cell {
                Cell::Timestamp(v) => b.append_value(v.and_utc().timestamp_micros()),
                Cell::Date(v) => b.append_option(v.and_hms_opt(0, 0, 0).map(|ts| ts.and_utc().timestamp_micros())),
                _ => b.append_null(),
            },
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
            ColumnBuilder::Date32(b) => Arc::new(b.finish()),
            ColumnBuilder::Timestamp(b) => Arc::new(b.finish()),
        }
    }
}

/// Accumulates rows into a single [`RecordBatch`].
pub struct BatchBuilder {
    schema: SchemaRef,
    builders: Vec<ColumnBuilder>,
    rows: usize,
}

impl BatchBuilder {
    pub fn new(columns: &[ColumnDescriptor], capacity: usize) -> Self {
        Self {
            schema: schema_for(columns),
            builders: columns.iter().map(|c| ColumnBuilder::new(c.kind, capacity)).collect(),
            rows: 0,
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Append one row. Missing trailing cells are filled with nulls, extra cells are ignored.
    pub fn append_row(&mut self, cells: impl IntoIterator<Item = Cell>) {
        let mut cells = cells.into_iter();
        for builder in &mut self.builders {
            builder.append(cells.next().unwrap_or(Cell::Null));
        }
        self.rows += 1;
    }

    pub fn finish(mut self) -> Result<RecordBatch, ArrowError> {
        let arrays: Vec<ArrayRef> = self.builders.iter_mut().map(ColumnBuilder::finish).collect();
        let options = RecordBatchOptions::new().with_row_count(Some(self.rows));
        RecordBatch::try_new_with_options(self.schema, arrays, &options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Date32Type, Float64Type, Int64Type, TimestampMicrosecondType};

    #[test]
    fn test_type_name_mapping() {
        assert_eq!(ColumnKind::from_type_name("INT4"), ColumnKind::Int64);
        assert_eq!(ColumnKind::from_type_name("BIGINT UNSIGNED"), ColumnKind::Int64);
        assert_eq!(ColumnKind::from_type_name("NUMERIC"), ColumnKind::Float64);
        assert_eq!(ColumnKind::from_type_name("DECIMAL"), ColumnKind::Float64);
        assert_eq!(ColumnKind::from_type_name("bool"), ColumnKind::Boolean);
        assert_eq!(ColumnKind::from_type_name("DATETIME"), ColumnKind::Timestamp);
        assert_eq!(ColumnKind::from_type_name("TIMESTAMPTZ"), ColumnKind::Timestamp);
        assert_eq!(ColumnKind::from_type_name("DATE"), ColumnKind::Date32);
        assert_eq!(ColumnKind::from_type_name("VARCHAR"), ColumnKind::Utf8);
        assert_eq!(ColumnKind::from_type_name("UUID"), ColumnKind::Utf8);
        assert_eq!(ColumnKind::from_type_name("YEAR"), ColumnKind::Int64);
        assert_eq!(ColumnKind::from_type_name("JSONB"), ColumnKind::Utf8);
    }

    #[test]
    fn test_build_batch() {
        let columns = vec![
            ColumnDescriptor::new("Region", ColumnKind::Utf8),
            ColumnDescriptor::new("Sales", ColumnKind::Float64),
            ColumnDescriptor::new("Orders", ColumnKind::Int64),
        ];
        let mut builder = BatchBuilder::new(&columns, 2);
        builder.append_row(vec![Cell::Text("Europe".into()), Cell::Float(100.5), Cell::Int(3)]);
        builder.append_row(vec![Cell::Null, Cell::Int(7), Cell::Null]);
        let batch = builder.finish().unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(1).data_type(), &DataType::Float64);
        assert_eq!(batch.column(0).as_string::<i32>().value(0), "Europe");
        assert!(batch.column(0).is_null(1));
        assert_eq!(batch.column(1).as_primitive::<Float64Type>().value(1), 7.0);
        assert_eq!(batch.column(2).as_primitive::<Int64Type>().value(0), 3);
        assert!(batch.column(2).is_null(1));
    }

    #[test]
    fn test_dates_and_timestamps() {
        let columns = vec![
            ColumnDescriptor::new("Day", ColumnKind::Date32),
            ColumnDescriptor::new("At", ColumnKind::Timestamp),
        ];
        let day = NaiveDate::from_ymd_opt(1970, 1, 11).unwrap();
        let at = day.and_hms_opt(0, 0, 1).unwrap();
        let mut builder = BatchBuilder::new(&columns, 1);
        builder.append_row(vec![Cell::Date(day), Cell::Timestamp(at)]);
        let batch = builder.finish().unwrap();

        assert_eq!(batch.column(0).as_primitive::<Date32Type>().value(0), 10);
        assert_eq!(
            batch.column(1).as_primitive::<TimestampMicrosecondType>().value(0),
            (10 * 86_400 + 1) * 1_000_000
        );
    }

    #[test]
    fn test_empty_result_keeps_schema() {
        let columns = vec![ColumnDescriptor::new("Region", ColumnKind::Utf8)];
        let batch = BatchBuilder::new(&columns, 0).finish().unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.schema().field(0).name(), "Region");
    }

    #[test]
    fn test_short_rows_are_padded_with_nulls() {
        let columns = vec![
            ColumnDescriptor::new("a", ColumnKind::Int64),
            ColumnDescriptor::new("b", ColumnKind::Int64),
        ];
        let mut builder = BatchBuilder::new(&columns, 1);
        builder.append_row(vec![Cell::Int(1)]);
        let batch = builder.finish().unwrap();
        assert!(batch.column(1).is_null(0));
    }
}
