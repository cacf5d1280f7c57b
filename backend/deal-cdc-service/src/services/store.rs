use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{PipelineError, Result};
use crate::services::cdc::models::{MONTH, PRICE, PRODUCT_NAME, REVENUE};
use crate::services::cdc::{ChangeRecord, ProductImage};
use crate::services::keys::SurrogateKeys;

/// Analytical store operations the pipeline and backfill need
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn bulk_insert(&self, table: &str, rows: &[StagingRow]) -> Result<()>;

    async fn fetch_products(&self, sql: &str) -> Result<Vec<ProductRow>>;

    /// First column of every row, as text
    async fn fetch_strings(&self, sql: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

/// Row struct for the staging table - used for type-safe ClickHouse inserts
/// Uses u32 for DateTime columns to avoid clickhouse-rs serialization issues
#[derive(Debug, Clone, Row, Serialize, Deserialize, PartialEq)]
pub struct StagingRow {
    pub product_base_id: i64,
    pub product_name: String,
    pub product_description: String,
    pub category: String,
    pub brand: String,
    pub product_rating: f64,
    pub product_image: String,
    pub shop_name: String,
    pub shop_link: String,
    pub revenue: f64,
    pub month: String,
    pub price: f64,
    pub quantity: i64,
    pub deal_name: String,
    pub operation_type: String,
    pub load_date: u32,
    pub record_source: String,
    pub change_timestamp: u32,
    pub product_hash_key: u64,
    pub deal_hash_key: u64,
    pub product_deal_hash_key: u64,
    pub product_hash_diff: u64,
}

impl StagingRow {
    pub fn from_record(record: &ChangeRecord, keys: SurrogateKeys) -> Self {
        let image = &record.attributes;
        Self {
            product_base_id: image.product_id().unwrap_or_default(),
            product_name: image.text(PRODUCT_NAME),
            product_description: image.text("product_description"),
            category: image.text("category"),
            brand: image.text("brand"),
            product_rating: image.number("product_rating").unwrap_or_default(),
            product_image: image.text("product_image"),
            shop_name: image.text("shop_name"),
            shop_link: image.text("shop_link"),
            revenue: image.number(REVENUE).unwrap_or_default(),
            month: image.text(MONTH),
            price: image.number(PRICE).unwrap_or_default(),
            quantity: image
                .number("quantity")
                .map(|q| q as i64)
                .unwrap_or_default(),
            deal_name: record.destination_name.clone().unwrap_or_default(),
            operation_type: record.operation.code().to_string(),
            load_date: datetime_column("load_date", record.load_timestamp),
            record_source: record.record_source.as_str().to_string(),
            change_timestamp: datetime_column("change_timestamp", record.change_timestamp),
            product_hash_key: keys.product_key,
            deal_hash_key: keys.destination_key,
            product_deal_hash_key: keys.product_destination_key,
            product_hash_diff: keys.product_change_fingerprint,
        }
    }
}

/// Seconds for a ClickHouse `DateTime` column, clamped to its u32 range
fn datetime_column(column: &str, ts: DateTime<Utc>) -> u32 {
    u32::try_from(ts.timestamp()).unwrap_or_else(|_| {
        let clamped = if ts.timestamp() < 0 { 0 } else { u32::MAX };
        warn!(column, timestamp = %ts, clamped, "Timestamp outside DateTime range, clamped");
        clamped
    })
}

/// Product row read from the source warehouse for backfills
#[derive(Debug, Clone, Row, Serialize, Deserialize, PartialEq)]
pub struct ProductRow {
    pub product_base_id: i64,
    pub product_name: String,
    pub product_description: String,
    pub category: String,
    pub brand: String,
    pub product_rating: f64,
    pub product_image: String,
    pub shop_name: String,
    pub shop_link: String,
    pub revenue: f64,
    pub month: String,
    pub price: f64,
    pub quantity: i64,
}

impl ProductRow {
    pub fn into_image(self) -> Result<ProductImage> {
        match serde_json::to_value(self)? {
            Value::Object(fields) => Ok(ProductImage::new(fields)),
            other => Err(PipelineError::Internal(format!(
                "product row serialized to non-object: {}",
                other
            ))),
        }
    }
}

#[derive(Row, Deserialize)]
struct TextRow {
    value: String,
}

/// [`StoreClient`] over a ClickHouse HTTP client
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    insert_client: Client,
}

impl ClickHouseStore {
    pub fn new(client: Client) -> Self {
        let insert_client = client
            .clone()
            .with_option("async_insert", "1")
            .with_option("wait_for_async_insert", "1");
        Self {
            client,
            insert_client,
        }
    }
}

#[async_trait]
impl StoreClient for ClickHouseStore {
    async fn bulk_insert(&self, table: &str, rows: &[StagingRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut insert = self.insert_client.insert::<StagingRow>(table).map_err(|e| {
            error!("ClickHouse insert preparation error: {}", e);
            PipelineError::ClickHouse(e.to_string())
        })?;

        for row in rows {
            insert.write(row).await.map_err(|e| {
                error!("ClickHouse row write error: {}", e);
                PipelineError::ClickHouse(e.to_string())
            })?;
        }

        insert.end().await.map_err(|e| {
            error!("ClickHouse insert error: {}", e);
            PipelineError::ClickHouse(e.to_string())
        })?;

        debug!(table = %table, rows = rows.len(), "Inserted staging rows");
        Ok(())
    }

    async fn fetch_products(&self, sql: &str) -> Result<Vec<ProductRow>> {
        let rows = self.client.query(sql).fetch_all::<ProductRow>().await?;
        Ok(rows)
    }

    async fn fetch_strings(&self, sql: &str) -> Result<Vec<String>> {
        let rows = self.client.query(sql).fetch_all::<TextRow>().await?;
        Ok(rows.into_iter().map(|row| row.value).collect())
    }

    async fn ping(&self) -> Result<()> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cdc::{CdcOperation, RecordSource};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_staging_row_from_record() {
        let image: ProductImage = serde_json::from_value(json!({
            "product_base_id": "42",
            "product_name": "Serum",
            "category": "Skincare",
            "brand": "Hapas Beauty",
            "price": "150000",
            "revenue": 9000.5,
            "month": "2024-03",
            "quantity": 7
        }))
        .unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let record = ChangeRecord::upsert(image, "Deal A", CdcOperation::Update, ts, RecordSource::CdcKafka);
        let keys = record.keys.unwrap();

        let row = StagingRow::from_record(&record, keys);
        assert_eq!(row.product_base_id, 42);
        assert_eq!(row.price, 150000.0);
        assert_eq!(row.quantity, 7);
        assert_eq!(row.product_description, "");
        assert_eq!(row.deal_name, "Deal A");
        assert_eq!(row.operation_type, "u");
        assert_eq!(row.record_source, "cdc_kafka");
        assert_eq!(row.change_timestamp, ts.timestamp() as u32);
        assert_eq!(row.product_deal_hash_key, keys.product_destination_key);
    }

    #[test]
    fn test_out_of_range_timestamps_are_clamped() {
        let image: ProductImage = serde_json::from_value(json!({"product_base_id": 1})).unwrap();
        let mut record = ChangeRecord::upsert(
            image,
            "Deal A",
            CdcOperation::Create,
            Utc.with_ymd_and_hms(1969, 12, 31, 0, 0, 0).unwrap(),
            RecordSource::CdcKafka,
        );
        let keys = record.keys.unwrap();
        assert_eq!(StagingRow::from_record(&record, keys).change_timestamp, 0);

        record.change_timestamp = Utc.with_ymd_and_hms(2200, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(StagingRow::from_record(&record, keys).change_timestamp, u32::MAX);
    }

    #[test]
    fn test_product_row_into_image() {
        let row = ProductRow {
            product_base_id: 5,
            product_name: "Lipstick".to_string(),
            product_description: String::new(),
            category: "Makeup".to_string(),
            brand: "Hapas".to_string(),
            product_rating: 4.5,
            product_image: String::new(),
            shop_name: "Shop".to_string(),
            shop_link: String::new(),
            revenue: 10.0,
            month: "2024-01".to_string(),
            price: 99.0,
            quantity: 3,
        };
        let image = row.into_image().unwrap();
        assert_eq!(image.product_id(), Some(5));
        assert_eq!(image.text("category"), "Makeup");
        assert_eq!(image.number("price"), Some(99.0));
    }

    #[tokio::test]
    #[ignore] // Requires ClickHouse on localhost:8123
    async fn test_clickhouse_ping() {
        let store = ClickHouseStore::new(Client::default().with_url("http://localhost:8123"));
        assert!(store.ping().await.is_ok());
    }
}
