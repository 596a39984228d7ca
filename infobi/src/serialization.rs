//! Arrow IPC stream encoding and JSON row rendering.
//!
//! Pivot and raw-data results travel as IPC *stream* payloads: a schema message followed by the
//! record batches, decodable with no other context. Grid, drill and distinct responses are small
//! and go out as JSON rows instead.

use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::json::WriterBuilder;
use arrow::json::writer::JsonArray;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use serde_json::{Map, Value};

/// Media type of an Arrow IPC stream response.
pub const ARROW_STREAM_MEDIA_TYPE: &str = "application/vnd.apache.arrow.stream";

/// Encode `batches` as an IPC stream. An empty slice still yields the schema message.
pub fn encode_stream(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<Bytes, ArrowError> {
    let mut writer = StreamWriter::try_new(Vec::new(), schema)?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    Ok(Bytes::from(writer.into_inner()?))
}

/// Decode an IPC stream produced by [`encode_stream`].
pub fn decode_stream(bytes: &[u8]) -> Result<(SchemaRef, Vec<RecordBatch>), ArrowError> {
    let reader = StreamReader::try_new(bytes, None)?;
    let schema = reader.schema();
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}

/// Render batches as JSON objects keyed by column name, nulls kept explicit.
pub fn batches_to_json_rows(batches: &[RecordBatch]) -> Result<Vec<Map<String, Value>>, ArrowError> {
    let mut writer = WriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, JsonArray>(Vec::new());
    let refs: Vec<&RecordBatch> = batches.iter().collect();
    writer.write_batches(&refs)?;
    writer.finish()?;

    let buffer = writer.into_inner();
    if buffer.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&buffer).map_err(|e| ArrowError::JsonError(e.to_string()))
}

/// Values of the first column, in row order.
pub fn first_column_values(batches: &[RecordBatch]) -> Result<Vec<Value>, ArrowError> {
    let Some(name) = batches.first().and_then(|b| b.schema().fields().first().map(|f| f.name().clone())) else {
        return Ok(Vec::new());
    };
    Ok(batches_to_json_rows(batches)?
        .into_iter()
        .map(|mut row| row.remove(&name).unwrap_or(Value::Null))
        .collect())
}
