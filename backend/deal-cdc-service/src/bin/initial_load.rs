//! One-shot historical load for destinations added to the rule file.

use anyhow::{bail, Context, Result};
use ch_pool::{create_pool, ChConfig};
use deal_cdc_service::config::PipelineConfig;
use deal_cdc_service::logging::init_tracing;
use deal_cdc_service::metrics::gather_metrics;
use deal_cdc_service::services::filters::{FilterEngine, JsonFileRuleSource, RuleSource};
use deal_cdc_service::services::{
    BatchWriter, ClickHouseStore, InitialLoader, IntegrityManager, StoreClient,
};
use std::sync::Arc;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting initial load");

    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    let rules = JsonFileRuleSource::new(&config.rules_path)
        .load()
        .await
        .context("Failed to load destination filter rules")?;
    let engine = Arc::new(FilterEngine::new(rules));

    let edw_config = ChConfig::from_env("CLICKHOUSE_EDW").context("Invalid warehouse configuration")?;
    let source_config =
        ChConfig::from_env("CLICKHOUSE_SOURCE").context("Invalid source configuration")?;
    edw_config.log_config();
    source_config.log_config();

    let warehouse = Arc::new(
        create_pool(&edw_config, ClickHouseStore::new).context("Failed to create warehouse pool")?,
    );
    let source = Arc::new(
        create_pool(&source_config, ClickHouseStore::new).context("Failed to create source pool")?,
    );
    for pool in [&warehouse, &source] {
        let client = pool
            .acquire()
            .await
            .with_context(|| format!("Failed to lease {} client", pool.name()))?;
        client
            .ping()
            .await
            .with_context(|| format!("ClickHouse {} is not reachable", pool.name()))?;
    }

    let writer = BatchWriter::new(
        Arc::clone(&warehouse),
        Arc::new(IntegrityManager::new(config.dedup_cache_cap)),
        config.staging_table.clone(),
        config.chunk_size,
        config.writer_parallelism,
    );
    let loader = InitialLoader::new(source, warehouse, writer, engine);

    let report = loader.run().await.context("Initial load aborted")?;
    debug!("Metrics snapshot:\n{}", gather_metrics());

    for load in report.loads.iter().filter(|load| !load.success) {
        error!(
            destination = %load.destination,
            extracted = load.extracted,
            "Destination load failed"
        );
    }

    if !report.success() {
        bail!("initial load failed for at least one destination");
    }
    info!(
        destinations = report.loads.len(),
        rows = report.rows_written(),
        "Initial load complete"
    );
    Ok(())
}
