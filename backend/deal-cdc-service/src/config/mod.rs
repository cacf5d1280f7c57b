use serde::Deserialize;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::services::pipeline::BatchPolicy;

/// Pipeline tuning, read from `DEAL_CDC_*`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,
    #[serde(default = "default_max_batch_wait_seconds")]
    pub max_batch_wait_seconds: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_writer_parallelism")]
    pub writer_parallelism: usize,
    #[serde(default = "default_dedup_cache_cap")]
    pub dedup_cache_cap: usize,
    #[serde(default = "default_store_client_pool_size")]
    pub store_client_pool_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_processing_timeout_seconds")]
    pub processing_timeout_seconds: u64,
    #[serde(default = "default_rules_path")]
    pub rules_path: String,
    /// 0 disables periodic reload
    #[serde(default)]
    pub rules_reload_seconds: u64,
    #[serde(default = "default_staging_table")]
    pub staging_table: String,
}

fn default_max_batch_records() -> usize {
    1000
}

fn default_max_batch_wait_seconds() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_writer_parallelism() -> usize {
    4
}

fn default_dedup_cache_cap() -> usize {
    10_000
}

fn default_store_client_pool_size() -> usize {
    4
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_processing_timeout_seconds() -> u64 {
    300
}

fn default_rules_path() -> String {
    "config/deal_filters.json".to_string()
}

fn default_staging_table() -> String {
    "edw.stg_products".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_records: default_max_batch_records(),
            max_batch_wait_seconds: default_max_batch_wait_seconds(),
            chunk_size: default_chunk_size(),
            writer_parallelism: default_writer_parallelism(),
            dedup_cache_cap: default_dedup_cache_cap(),
            store_client_pool_size: default_store_client_pool_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            processing_timeout_seconds: default_processing_timeout_seconds(),
            rules_path: default_rules_path(),
            rules_reload_seconds: 0,
            staging_table: default_staging_table(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("DEAL_CDC_")
            .from_env()
            .map_err(|e| PipelineError::Configuration(format!("DEAL_CDC_*: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("max_batch_records", self.max_batch_records as u64),
            ("max_batch_wait_seconds", self.max_batch_wait_seconds),
            ("chunk_size", self.chunk_size as u64),
            ("writer_parallelism", self.writer_parallelism as u64),
            ("dedup_cache_cap", self.dedup_cache_cap as u64),
            ("store_client_pool_size", self.store_client_pool_size as u64),
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("processing_timeout_seconds", self.processing_timeout_seconds),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(PipelineError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if self.staging_table.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "staging_table must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            max_records: self.max_batch_records,
            max_wait: Duration::from_secs(self.max_batch_wait_seconds),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            processing_timeout: Duration::from_secs(self.processing_timeout_seconds),
            rules_reload: (self.rules_reload_seconds > 0)
                .then(|| Duration::from_secs(self.rules_reload_seconds)),
        }
    }
}

/// Kafka consumer settings, read from `KAFKA_*`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KafkaConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
}

fn default_bootstrap_servers() -> String {
    "kafka:29092".to_string()
}

fn default_topic() -> String {
    "edw_cdc.product_changes_log".to_string()
}

fn default_group_id() -> String {
    "cdc_processor_group".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_metadata_timeout_ms() -> u64 {
    10_000
}

impl KafkaConfig {
    pub fn from_env() -> Result<Self> {
        envy::prefixed("KAFKA_")
            .from_env()
            .map_err(|e| PipelineError::Configuration(format!("KAFKA_*: {}", e)))
    }
}
