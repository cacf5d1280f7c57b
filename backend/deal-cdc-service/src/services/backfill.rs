//! Initial load for destinations the warehouse has never seen
//!
//! Extraction pushes each destination's rule predicate down to the source
//! warehouse, so a backfill selects exactly what live filtering would route.

use ch_pool::ClientPool;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::services::cdc::{CdcOperation, ChangeRecord, RecordSource};
use crate::services::filters::{DestinationRuleSet, FilterEngine};
use crate::services::store::StoreClient;
use crate::services::writer::BatchWriter;

pub const EXISTING_DESTINATIONS_SQL: &str =
    "SELECT DISTINCT deal_business_key FROM edw.hub_deal WHERE deal_business_key IS NOT NULL";

pub const SOURCE_PRODUCTS_TABLE: &str = "staging.products";

/// Configured destinations with no rows in the warehouse yet, in rule order
pub fn new_destinations(existing: &BTreeSet<String>, configured: &DestinationRuleSet) -> Vec<String> {
    configured
        .destination_names()
        .filter(|name| !existing.contains(*name))
        .map(str::to_string)
        .collect()
}

/// Extraction query for one destination. Columns are coerced to the
/// non-nullable types of [`crate::services::store::ProductRow`].
pub fn extract_query(table: &str, where_fragment: &str) -> String {
    format!(
        "SELECT \
            toInt64(product_base_id) AS product_base_id, \
            ifNull(toString(product_name), '') AS product_name, \
            ifNull(toString(product_description), '') AS product_description, \
            ifNull(toString(category), '') AS category, \
            ifNull(toString(brand), '') AS brand, \
            ifNull(toFloat64OrNull(toString(product_rating)), 0) AS product_rating, \
            ifNull(toString(product_image), '') AS product_image, \
            ifNull(toString(shop_name), '') AS shop_name, \
            ifNull(toString(shop_link), '') AS shop_link, \
            ifNull(toFloat64OrNull(toString(revenue)), 0) AS revenue, \
            ifNull(toString(month), '') AS month, \
            ifNull(toFloat64OrNull(toString(price)), 0) AS price, \
            ifNull(toInt64OrNull(toString(quantity)), 0) AS quantity \
        FROM {} \
        WHERE product_base_id IS NOT NULL AND ({})",
        table, where_fragment
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationLoad {
    pub destination: String,
    pub extracted: usize,
    pub written: usize,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub existing: usize,
    pub loads: Vec<DestinationLoad>,
}

impl BackfillReport {
    pub fn success(&self) -> bool {
        self.loads.iter().all(|load| load.success)
    }

    pub fn rows_written(&self) -> usize {
        self.loads.iter().map(|load| load.written).sum()
    }
}

pub struct InitialLoader<C> {
    source: Arc<ClientPool<C>>,
    warehouse: Arc<ClientPool<C>>,
    writer: BatchWriter<C>,
    rules: Arc<FilterEngine>,
    source_table: String,
}

impl<C: StoreClient> InitialLoader<C> {
    /// `writer` should write through the `warehouse` pool.
    pub fn new(
        source: Arc<ClientPool<C>>,
        warehouse: Arc<ClientPool<C>>,
        writer: BatchWriter<C>,
        rules: Arc<FilterEngine>,
    ) -> Self {
        Self {
            source,
            warehouse,
            writer,
            rules,
            source_table: SOURCE_PRODUCTS_TABLE.to_string(),
        }
    }

    /// Destination names already loaded. A failed lookup (usually a missing
    /// hub table on a fresh warehouse) counts as none.
    pub async fn existing_destinations(&self) -> BTreeSet<String> {
        let result: Result<Vec<String>> = async {
            let client = self.warehouse.acquire().await?;
            client.fetch_strings(EXISTING_DESTINATIONS_SQL).await
        }
        .await;

        match result {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                warn!("Could not read existing destinations, treating all as new: {}", e);
                BTreeSet::new()
            }
        }
    }

    pub async fn run(&self) -> Result<BackfillReport> {
        let existing = self.existing_destinations().await;
        let rules = self.rules.snapshot();
        let pending = new_destinations(&existing, &rules);

        info!(
            existing = existing.len(),
            configured = rules.len(),
            pending = pending.len(),
            "Starting initial load"
        );

        let mut report = BackfillReport {
            existing: existing.len(),
            loads: Vec::with_capacity(pending.len()),
        };
        for destination in pending {
            let load = self.load_destination(&destination).await?;
            report.loads.push(load);
        }

        info!(
            destinations = report.loads.len(),
            rows = report.rows_written(),
            success = report.success(),
            "Initial load finished"
        );
        Ok(report)
    }

    async fn load_destination(&self, destination: &str) -> Result<DestinationLoad> {
        let fragment = self.rules.where_clause_fragment(destination);
        let sql = extract_query(&self.source_table, &fragment);

        let rows = {
            let client = self.source.acquire().await?;
            client.fetch_products(&sql).await.map_err(|e| {
                error!(destination = %destination, "Extraction failed: {}", e);
                e
            })?
        };
        let extracted = rows.len();

        let now = Utc::now();
        let mut records = Vec::with_capacity(extracted);
        for row in rows {
            let image = row.into_image()?;
            records.push(ChangeRecord::upsert(
                image,
                destination,
                CdcOperation::Read,
                now,
                RecordSource::InitialLoad,
            ));
        }

        let commit = self.writer.commit(records).await;
        info!(
            destination = %destination,
            extracted,
            written = commit.rows_written,
            success = commit.success,
            "Destination loaded"
        );

        Ok(DestinationLoad {
            destination: destination.to_string(),
            extracted,
            written: commit.rows_written,
            success: commit.success,
        })
    }
}
