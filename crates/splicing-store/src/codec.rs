use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::Value;

use crate::error::StoreResult;

/// Marker distinguishing tabular payloads from JSON text.
pub const TABLE_PREFIX: &str = "parquet+base64:";

/// A decoded scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Json(Value),
    Table(RecordBatch),
}

impl StoredValue {
    pub fn encode(&self) -> StoreResult<String> {
        match self {
            StoredValue::Json(value) => Ok(serde_json::to_string(value)?),
            StoredValue::Table(batch) => encode_table(batch),
        }
    }

    pub fn decode(raw: &str) -> StoreResult<Self> {
        if raw.starts_with(TABLE_PREFIX) {
            return Ok(StoredValue::Table(decode_table(raw)?));
        }
        Ok(StoredValue::Json(serde_json::from_str(raw)?))
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            StoredValue::Json(value) => Some(value),
            StoredValue::Table(_) => None,
        }
    }

    pub fn into_table(self) -> Option<RecordBatch> {
        match self {
            StoredValue::Table(batch) => Some(batch),
            StoredValue::Json(_) => None,
        }
    }
}

/// Arrow batch → Parquet bytes → base64 text, prefixed with [`TABLE_PREFIX`].
pub fn encode_table(batch: &RecordBatch) -> StoreResult<String> {
    let bytes = table_to_parquet(batch)?;
    Ok(format!("{TABLE_PREFIX}{}", STANDARD.encode(bytes)))
}

/// Inverse of [`encode_table`]. Accepts payloads with or without the prefix.
pub fn decode_table(raw: &str) -> StoreResult<RecordBatch> {
    let payload = raw.strip_prefix(TABLE_PREFIX).unwrap_or(raw);
    table_from_parquet(STANDARD.decode(payload.as_bytes())?)
}

/// A batch as the bytes of a standalone Parquet file.
pub fn table_to_parquet(batch: &RecordBatch) -> StoreResult<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)?;
    writer.write(batch)?;
    Ok(writer.into_inner()?)
}

/// Reads a whole Parquet file into one batch.
/// A file without row groups decodes to an empty batch with its schema.
pub fn table_from_parquet(bytes: Vec<u8>) -> StoreResult<RecordBatch> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes))?;
    let schema = Arc::clone(builder.schema());
    let batches = builder
        .build()?
        .collect::<Result<Vec<_>, arrow::error::ArrowError>>()?;
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    Ok(concat_batches(&schema, &batches)?)
}

/// First `rows` rows of `batch` as a JSON array of row objects.
pub fn table_preview(batch: &RecordBatch, rows: usize) -> StoreResult<Value> {
    let head = batch.slice(0, rows.min(batch.num_rows()));
    if head.num_rows() == 0 {
        return Ok(Value::Array(Vec::new()));
    }
    let mut writer = arrow::json::ArrayWriter::new(Vec::new());
    writer.write(&head)?;
    writer.finish()?;
    Ok(serde_json::from_slice(&writer.into_inner())?)
}

/// `(column, type, nullable)` triples describing a batch's columns.
pub fn table_schema(batch: &RecordBatch) -> Vec<(String, String, bool)> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|field| {
            (
                field.name().clone(),
                field.data_type().to_string(),
                field.is_nullable(),
            )
        })
        .collect()
}
