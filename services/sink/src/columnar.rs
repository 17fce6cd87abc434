//! Columnar serialization for warehouse files.
//!
//! Each partition flush produces one Parquet file with a flat row per
//! event: envelope fields, category/type strings, denormalized device
//! context, the payload as a JSON column (variant schema evolution never
//! breaks the file schema), and the four integer partition columns that
//! the query engine also reads back from the object path.

use arrow::array::{ArrayRef, BooleanArray, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use causality_protocol::{Event, PartitionKey};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ColumnarError {
    #[error("arrow: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The flat warehouse schema.  Column order is frozen; additions go at the
/// end (before the partition columns is also acceptable to the reader, but
/// appending keeps old files prefix-compatible).
pub fn file_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("event_id", DataType::Utf8, false),
        Field::new("app_id", DataType::Utf8, false),
        Field::new("device_id", DataType::Utf8, false),
        Field::new("timestamp_ms", DataType::Int64, false),
        Field::new("correlation_id", DataType::Utf8, true),
        Field::new("idempotency_key", DataType::Utf8, false),
        Field::new("event_category", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("platform", DataType::Utf8, false),
        Field::new("os_version", DataType::Utf8, false),
        Field::new("app_version", DataType::Utf8, false),
        Field::new("build_number", DataType::Utf8, false),
        Field::new("model", DataType::Utf8, false),
        Field::new("manufacturer", DataType::Utf8, false),
        Field::new("screen_width", DataType::Int32, false),
        Field::new("screen_height", DataType::Int32, false),
        Field::new("locale", DataType::Utf8, false),
        Field::new("timezone", DataType::Utf8, false),
        Field::new("network_type", DataType::Utf8, false),
        Field::new("carrier", DataType::Utf8, false),
        Field::new("is_jailbroken", DataType::Boolean, false),
        Field::new("is_emulator", DataType::Boolean, false),
        Field::new("sdk_version", DataType::Utf8, false),
        Field::new("payload_json", DataType::Utf8, false),
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
        Field::new("day", DataType::Int32, false),
        Field::new("hour", DataType::Int32, false),
    ]))
}

/// Flatten one partition's events into a record batch.
pub fn to_record_batch(
    partition: &PartitionKey,
    events: &[Event],
) -> Result<RecordBatch, ColumnarError> {
    let mut payload_json = Vec::with_capacity(events.len());
    for event in events {
        payload_json.push(serde_json::to_string(&event.payload)?);
    }

    let columns: Vec<ArrayRef> = vec![
        string_col(events, |e| e.event_id.as_str()),
        string_col(events, |e| e.app_id.as_str()),
        string_col(events, |e| e.device_id.as_str()),
        Arc::new(Int64Array::from(
            events.iter().map(|e| e.timestamp_ms).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            events
                .iter()
                .map(|e| e.correlation_id.as_deref())
                .collect::<Vec<_>>(),
        )),
        string_col(events, |e| e.idempotency_key.as_str()),
        string_col(events, |e| e.payload.category()),
        string_col(events, |e| e.payload.event_type()),
        string_col(events, |e| e.context.platform.as_str()),
        string_col(events, |e| e.context.os_version.as_str()),
        string_col(events, |e| e.context.app_version.as_str()),
        string_col(events, |e| e.context.build_number.as_str()),
        string_col(events, |e| e.context.model.as_str()),
        string_col(events, |e| e.context.manufacturer.as_str()),
        int32_col(events, |e| e.context.screen_width as i32),
        int32_col(events, |e| e.context.screen_height as i32),
        string_col(events, |e| e.context.locale.as_str()),
        string_col(events, |e| e.context.timezone.as_str()),
        string_col(events, |e| e.context.network_type.as_str()),
        string_col(events, |e| e.context.carrier.as_str()),
        Arc::new(BooleanArray::from(
            events
                .iter()
                .map(|e| e.context.is_jailbroken)
                .collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            events
                .iter()
                .map(|e| e.context.is_emulator)
                .collect::<Vec<_>>(),
        )),
        string_col(events, |e| e.context.sdk_version.as_str()),
        Arc::new(StringArray::from(payload_json)),
        Arc::new(Int32Array::from(vec![partition.year; events.len()])),
        int32_partition_col(partition.month, events.len()),
        int32_partition_col(partition.day, events.len()),
        int32_partition_col(partition.hour, events.len()),
    ];

    Ok(RecordBatch::try_new(file_schema(), columns)?)
}

fn string_col(events: &[Event], f: impl Fn(&Event) -> &str) -> ArrayRef {
    Arc::new(StringArray::from(
        events.iter().map(|e| f(e)).collect::<Vec<_>>(),
    ))
}

fn int32_col(events: &[Event], f: impl Fn(&Event) -> i32) -> ArrayRef {
    Arc::new(Int32Array::from(
        events.iter().map(|e| f(e)).collect::<Vec<_>>(),
    ))
}

fn int32_partition_col(value: u32, len: usize) -> ArrayRef {
    Arc::new(Int32Array::from(vec![value as i32; len]))
}

/// Serialize one partition's events to Parquet bytes (snappy-compressed).
pub fn encode_partition(
    partition: &PartitionKey,
    events: &[Event],
) -> Result<Vec<u8>, ColumnarError> {
    let batch = to_record_batch(partition, events)?;
    encode_batches(&[batch])
}

/// Serialize pre-built record batches into a single Parquet file.
///
/// Used directly by compaction, which merges the row groups of many small
/// files into one output without round-tripping through `Event`.
pub fn encode_batches(batches: &[RecordBatch]) -> Result<Vec<u8>, ColumnarError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, file_schema(), Some(props))?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;
    Ok(buf)
}

/// Read every record batch out of a Parquet file.
pub fn decode_batches(data: Vec<u8>) -> Result<Vec<RecordBatch>, ColumnarError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(data))?.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

/// Total row count across batches.
pub fn row_count(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use causality_protocol::{DeviceContext, EventPayload};

    fn event(idempotency_key: &str, timestamp_ms: i64) -> Event {
        Event {
            event_id: format!("evt-{}", idempotency_key),
            app_id: "app-1".to_owned(),
            device_id: "dev-1".to_owned(),
            timestamp_ms,
            correlation_id: Some("sess-1".to_owned()),
            idempotency_key: idempotency_key.to_owned(),
            context: DeviceContext {
                os_version: "17.2".to_owned(),
                screen_width: 1179,
                ..DeviceContext::default()
            },
            payload: EventPayload::Screen {
                event_type: "screen_view".to_owned(),
                properties: serde_json::json!({"screen_name": "Home"}),
            },
        }
    }

    #[test]
    fn encode_then_decode_preserves_rows_and_partitions() {
        let partition = PartitionKey::from_timestamp_ms("app-1", 1768473000000).unwrap();
        let events = vec![event("k1", 1768473000000), event("k2", 1768473000500)];

        let bytes = encode_partition(&partition, &events).expect("encode");
        assert!(!bytes.is_empty());

        let batches = decode_batches(bytes).expect("decode");
        assert_eq!(row_count(&batches), 2);

        let batch = &batches[0];
        let keys = batch
            .column_by_name("idempotency_key")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(keys.value(0), "k1");
        assert_eq!(keys.value(1), "k2");

        let hours = batch
            .column_by_name("hour")
            .unwrap()
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!(hours.value(0), 10);

        let payloads = batch
            .column_by_name("payload_json")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        let payload: serde_json::Value = serde_json::from_str(payloads.value(0)).unwrap();
        assert_eq!(payload["properties"]["screen_name"], "Home");
    }

    #[test]
    fn merged_batches_concatenate_rows() {
        let partition = PartitionKey::from_timestamp_ms("app-1", 1768473000000).unwrap();
        let first = encode_partition(&partition, &[event("k1", 1768473000000)]).unwrap();
        let second = encode_partition(&partition, &[event("k2", 1768473000001)]).unwrap();

        let mut batches = decode_batches(first).unwrap();
        batches.extend(decode_batches(second).unwrap());
        let merged = encode_batches(&batches).unwrap();

        assert_eq!(row_count(&decode_batches(merged).unwrap()), 2);
    }
}
