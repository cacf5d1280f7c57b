use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::services::keys::{key_text, numeric_key_text, SurrogateKeys};

pub const PRODUCT_ID: &str = "product_base_id";
pub const PRODUCT_NAME: &str = "product_name";
pub const CATEGORY: &str = "category";
pub const PRICE: &str = "price";
pub const REVENUE: &str = "revenue";
pub const MONTH: &str = "month";
pub const CHANGE_TIMESTAMP: &str = "change_timestamp";

/// CDC operation types from Debezium
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum CdcOperation {
    /// Insert operation (c = create)
    #[serde(rename = "c")]
    #[default]
    Create,
    /// Update operation (u = update)
    #[serde(rename = "u")]
    Update,
    /// Delete operation (d = delete)
    #[serde(rename = "d")]
    Delete,
    /// Read operation (r = read, initial snapshot)
    #[serde(rename = "r")]
    Read,
}

impl CdcOperation {
    /// Single-letter code stored in `operation_type`
    pub fn code(&self) -> &'static str {
        match self {
            CdcOperation::Create => "c",
            CdcOperation::Update => "u",
            CdcOperation::Delete => "d",
            CdcOperation::Read => "r",
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, CdcOperation::Delete)
    }
}

/// CDC message structure from Debezium
///
/// When `value.converter.schemas.enable = false`, Debezium sends the payload directly
/// without a wrapper object. This enum handles both formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CdcMessage {
    /// Format with schema wrapper (value.converter.schemas.enable = true)
    WithSchema { payload: CdcPayload },
    /// Format without schema wrapper (value.converter.schemas.enable = false)
    WithoutSchema(CdcPayload),
}

impl CdcMessage {
    /// The payload regardless of message format
    pub fn into_payload(self) -> CdcPayload {
        match self {
            CdcMessage::WithSchema { payload } => payload,
            CdcMessage::WithoutSchema(payload) => payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcPayload {
    /// State before the change (null for create, populated for update/delete)
    #[serde(default)]
    pub before: Option<ProductImage>,

    /// State after the change (null for delete)
    #[serde(default)]
    pub after: Option<ProductImage>,

    /// Source metadata, absent when the connector strips it
    #[serde(default)]
    pub source: Option<CdcSource>,

    /// Operation type (c/u/d/r), defaults to create
    #[serde(default)]
    pub op: CdcOperation,

    /// Transaction timestamp in milliseconds since epoch
    #[serde(default)]
    pub ts_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcSource {
    #[serde(default)]
    pub connector: Option<String>,
    #[serde(default)]
    pub db: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub ts_ms: Option<i64>,
}

/// A before/after row image. Column names map to raw JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductImage(Map<String, Value>);

impl ProductImage {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column).filter(|v| !v.is_null())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Product identifier as an integer, accepting numeric strings
    pub fn product_id(&self) -> Option<i64> {
        as_i64(self.get(PRODUCT_ID)?)
    }

    pub fn text(&self, column: &str) -> String {
        match self.get(column) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        as_f64(self.get(column)?)
    }

    /// Surrogate keys for this image under `destination`
    pub fn surrogate_keys(&self, destination: &str) -> SurrogateKeys {
        SurrogateKeys::derive(
            &key_text(self.get(PRODUCT_ID)),
            destination,
            &key_text(self.get(PRODUCT_NAME)),
            &numeric_key_text(self.get(PRICE)),
            &numeric_key_text(self.get(REVENUE)),
        )
    }
}

pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub(crate) fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// A decoded upstream change, one per source message
#[derive(Debug, Clone, PartialEq)]
pub struct RawChangeEvent {
    pub operation: CdcOperation,
    pub before: Option<ProductImage>,
    pub after: Option<ProductImage>,
    pub ts_ms: Option<i64>,
}

impl RawChangeEvent {
    /// Decode a Debezium JSON payload, with or without the schema wrapper
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: CdcMessage = serde_json::from_slice(bytes)?;
        Ok(Self::from(message.into_payload()))
    }

    /// Best source timestamp for this event
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.ts_ms.and_then(DateTime::from_timestamp_millis)
    }
}

impl From<CdcPayload> for RawChangeEvent {
    fn from(payload: CdcPayload) -> Self {
        let ts_ms = payload
            .ts_ms
            .or_else(|| payload.source.as_ref().and_then(|s| s.ts_ms));
        Self {
            operation: payload.op,
            before: payload.before.filter(|image| !image.is_empty()),
            after: payload.after.filter(|image| !image.is_empty()),
            ts_ms,
        }
    }
}

/// Where a change record entered the warehouse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    CdcKafka,
    CdcKafkaDelete,
    InitialLoad,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::CdcKafka => "cdc_kafka",
            RecordSource::CdcKafkaDelete => "cdc_kafka_delete",
            RecordSource::InitialLoad => "initial_load",
        }
    }
}

/// The pipeline's output unit
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub attributes: ProductImage,
    /// `None` for deletes, which are destination-agnostic
    pub destination_name: Option<String>,
    pub operation: CdcOperation,
    pub change_timestamp: DateTime<Utc>,
    pub load_timestamp: DateTime<Utc>,
    pub record_source: RecordSource,
    /// `None` for deletes
    pub keys: Option<SurrogateKeys>,
}

impl ChangeRecord {
    pub fn upsert(
        attributes: ProductImage,
        destination: &str,
        operation: CdcOperation,
        change_timestamp: DateTime<Utc>,
        record_source: RecordSource,
    ) -> Self {
        let keys = attributes.surrogate_keys(destination);
        Self {
            attributes,
            destination_name: Some(destination.to_string()),
            operation,
            change_timestamp,
            load_timestamp: Utc::now(),
            record_source,
            keys: Some(keys),
        }
    }

    /// Identifier-only delete record built from a before-image
    pub fn delete(before: &ProductImage, change_timestamp: DateTime<Utc>) -> Self {
        let mut fields = Map::new();
        if let Some(id) = before.get(PRODUCT_ID) {
            fields.insert(PRODUCT_ID.to_string(), id.clone());
        }
        Self {
            attributes: ProductImage::new(fields),
            destination_name: None,
            operation: CdcOperation::Delete,
            change_timestamp,
            load_timestamp: Utc::now(),
            record_source: RecordSource::CdcKafkaDelete,
            keys: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.operation.is_delete()
    }

    pub fn product_id(&self) -> Option<i64> {
        self.attributes.product_id()
    }
}

/// Resolve a change timestamp: image field, then event time, then now.
pub fn resolve_change_timestamp(image: &ProductImage, event_time: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let from_image = match image.get(CHANGE_TIMESTAMP) {
        Some(Value::String(s)) => parse_datetime_best_effort(s).ok(),
        Some(Value::Number(n)) => n.as_i64().and_then(from_epoch_number),
        _ => None,
    };
    from_image.or(event_time).unwrap_or_else(Utc::now)
}

/// Epoch number in milliseconds, microseconds (Debezium `MicroTimestamp`)
/// or nanoseconds, told apart by magnitude.
fn from_epoch_number(value: i64) -> Option<DateTime<Utc>> {
    match value.unsigned_abs() {
        v if v >= 100_000_000_000_000_000 => Some(DateTime::from_timestamp_nanos(value)),
        v if v >= 100_000_000_000_000 => DateTime::from_timestamp_micros(value),
        _ => DateTime::from_timestamp_millis(value),
    }
}

pub fn parse_datetime_best_effort(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    Err(PipelineError::Validation(format!(
        "Unsupported datetime format: {}",
        s
    )))
}
