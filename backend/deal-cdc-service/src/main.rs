use anyhow::{bail, Context, Result};
use ch_pool::{create_pool, ChConfig};
use deal_cdc_service::config::{KafkaConfig, PipelineConfig};
use deal_cdc_service::logging::init_tracing;
use deal_cdc_service::metrics::gather_metrics;
use deal_cdc_service::services::filters::{FilterEngine, JsonFileRuleSource, RuleSource};
use deal_cdc_service::services::{
    BatchWriter, CdcPipeline, ClickHouseStore, IntegrityManager, KafkaChangeSource, RunOutcome,
    StoreClient,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting deal-cdc-service");

    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    let kafka = KafkaConfig::from_env().context("Invalid Kafka configuration")?;

    let rule_source = Arc::new(JsonFileRuleSource::new(&config.rules_path));
    let rules = rule_source
        .load()
        .await
        .context("Failed to load destination filter rules")?;
    info!(destinations = rules.len(), "Filter rules ready");
    let engine = Arc::new(FilterEngine::new(rules));

    let source = KafkaChangeSource::new(&kafka).context("Failed to create Kafka change source")?;

    let mut edw = ChConfig::from_env("CLICKHOUSE_EDW").context("Invalid ClickHouse configuration")?;
    if std::env::var("CLICKHOUSE_EDW_POOL_SIZE").is_err() {
        edw.pool_size = config.store_client_pool_size;
    }
    edw.log_config();
    let pool = Arc::new(
        create_pool(&edw, ClickHouseStore::new).context("Failed to create ClickHouse pool")?,
    );
    {
        let client = pool.acquire().await.context("Failed to lease ClickHouse client")?;
        client.ping().await.context("ClickHouse is not reachable")?;
    }

    let integrity = Arc::new(IntegrityManager::new(config.dedup_cache_cap));
    let writer = BatchWriter::new(
        Arc::clone(&pool),
        Arc::clone(&integrity),
        config.staging_table.clone(),
        config.chunk_size,
        config.writer_parallelism,
    );
    let mut pipeline = CdcPipeline::new(source, writer, integrity, engine, config.batch_policy())
        .with_rule_source(rule_source);

    let topic = pipeline
        .preflight()
        .await
        .context("Kafka topic pre-flight failed")?;
    if topic.total_messages() == 0 {
        info!(topic = %topic.topic, "Topic is empty, nothing to process");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping after current batch");
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                // A dropped sender reads as a stop request; hold it until the deadline
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    let summary = pipeline.run(shutdown_rx).await.context("CDC pipeline aborted")?;
    debug!("Metrics snapshot:\n{}", gather_metrics());

    info!(
        outcome = ?summary.outcome,
        batches_committed = summary.batches_committed,
        batches_failed = summary.batches_failed,
        events_pulled = summary.events_pulled,
        records_written = summary.records_written,
        rejected = summary.stats.rejected(),
        "Run finished"
    );

    match summary.outcome {
        RunOutcome::Stalled => {
            warn!("Source position held after a failed batch; the next run will retry");
            bail!(
                "{} batch(es) failed to commit, source position held",
                summary.batches_failed
            )
        }
        RunOutcome::Idle | RunOutcome::Committed => Ok(()),
    }
}
