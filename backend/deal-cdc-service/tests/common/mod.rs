//! In-memory source and store used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ch_pool::ClientPool;
use deal_cdc_service::error::{PipelineError, Result};
use deal_cdc_service::services::cdc::RawChangeEvent;
use deal_cdc_service::services::filters::{parse_rules, DestinationRuleSet, FilterEngine};
use deal_cdc_service::services::pipeline::BatchPolicy;
use deal_cdc_service::services::source::{
    ChangeSource, CommitPosition, PartitionInfo, SourceEvent, SourcePosition, TopicInfo,
};
use deal_cdc_service::services::store::{ProductRow, StagingRow, StoreClient};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const RULES: &str = r#"{
    "Hapas Beauty Deal": [
        {"column_name": "brand", "operator": "EQUALS", "value": "Hapas"},
        {"column_name": "price", "operator": "GREATER_THAN", "value": "100000"}
    ],
    "Skincare Deal": [
        {"column_name": "category", "operator": "EQUALS", "value": "Skincare"}
    ]
}"#;

pub fn rule_set() -> DestinationRuleSet {
    parse_rules(RULES).expect("test rules parse")
}

pub fn engine() -> Arc<FilterEngine> {
    Arc::new(FilterEngine::new(rule_set()))
}

pub fn policy(max_records: usize) -> BatchPolicy {
    BatchPolicy {
        max_records,
        max_wait: Duration::from_secs(60),
        poll_timeout: Duration::from_millis(5),
        processing_timeout: Duration::from_secs(10),
        rules_reload: None,
    }
}

/// Debezium envelope with the schema wrapper, as Kafka Connect emits it
pub fn debezium(op: &str, before: Value, after: Value) -> Vec<u8> {
    json!({
        "schema": {"type": "struct", "optional": false},
        "payload": {
            "before": before,
            "after": after,
            "source": {"connector": "postgresql", "db": "edw", "table": "products", "ts_ms": 1709287200000i64},
            "op": op,
            "ts_ms": 1709287200123i64
        }
    })
    .to_string()
    .into_bytes()
}

pub fn product(id: i64, brand: &str, category: &str, price: f64) -> Value {
    json!({
        "product_base_id": id,
        "product_name": format!("Product {}", id),
        "category": category,
        "brand": brand,
        "price": price,
        "revenue": 1200.5,
        "month": "2024-03",
        "quantity": 3
    })
}

pub fn event_at(offset: i64, bytes: &[u8]) -> SourceEvent {
    SourceEvent {
        position: SourcePosition { partition: 0, offset },
        event: RawChangeEvent::decode(bytes).map_err(|e| {
            deal_cdc_service::RecordRejection::Malformed(e.to_string())
        }),
    }
}

pub fn create_event(offset: i64, image: Value) -> SourceEvent {
    event_at(offset, &debezium("c", Value::Null, image))
}

/// Scripted change source. Each pull serves the next scripted step; an empty
/// step simulates a poll that timed out. Once the script is exhausted it
/// optionally requests shutdown.
pub struct FakeSource {
    script: Mutex<VecDeque<Vec<SourceEvent>>>,
    commits: Mutex<Vec<CommitPosition>>,
    shutdown_on_drain: Option<broadcast::Sender<()>>,
    failed_commits: AtomicUsize,
}

impl FakeSource {
    pub fn new(script: Vec<Vec<SourceEvent>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            commits: Mutex::new(Vec::new()),
            shutdown_on_drain: None,
            failed_commits: AtomicUsize::new(0),
        }
    }

    /// Serve `events` in pulls of at most `max_items`
    pub fn from_events(events: Vec<SourceEvent>) -> Self {
        Self::new(vec![events])
    }

    pub fn shutdown_on_drain(mut self, sender: broadcast::Sender<()>) -> Self {
        self.shutdown_on_drain = Some(sender);
        self
    }

    /// Fail the next `count` position commits
    pub fn fail_commits(self, count: usize) -> Self {
        self.failed_commits.store(count, Ordering::SeqCst);
        self
    }

    pub fn commits(&self) -> Vec<CommitPosition> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeSource for FakeSource {
    async fn pull(&self, max_items: usize, max_wait: Duration) -> Result<Vec<SourceEvent>> {
        let step = {
            let mut script = self.script.lock().unwrap();
            match script.front().map(Vec::len) {
                Some(len) if len > max_items => script
                    .front_mut()
                    .map(|step| step.drain(..max_items).collect::<Vec<_>>()),
                Some(_) => script.pop_front(),
                None => None,
            }
        };

        match step {
            Some(events) if !events.is_empty() => Ok(events),
            Some(_) => {
                tokio::time::sleep(max_wait).await;
                Ok(Vec::new())
            }
            None => {
                if let Some(sender) = &self.shutdown_on_drain {
                    let _ = sender.send(());
                }
                tokio::time::sleep(max_wait).await;
                Ok(Vec::new())
            }
        }
    }

    async fn commit_position(&self, position: &CommitPosition) -> Result<()> {
        let failing = self
            .failed_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::Kafka("commit rejected: rebalance in progress".to_string()));
        }
        self.commits.lock().unwrap().push(position.clone());
        Ok(())
    }

    async fn describe_topic(&self) -> Result<TopicInfo> {
        let retained = self.script.lock().unwrap().iter().map(Vec::len).sum::<usize>() as i64;
        Ok(TopicInfo {
            topic: "edw_cdc.product_changes_log".to_string(),
            partitions: vec![PartitionInfo {
                partition: 0,
                low: 0,
                high: retained,
            }],
        })
    }
}

#[derive(Default)]
struct StoreState {
    inserts: Mutex<Vec<Vec<StagingRow>>>,
    queries: Mutex<Vec<String>>,
    products: Mutex<Vec<ProductRow>>,
    existing: Mutex<Option<Vec<String>>>,
    failing_inserts: AtomicUsize,
    insert_attempts: AtomicUsize,
}

/// Recording store. Clones share state, so a pool of clones behaves as one store.
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<StoreState>,
}

impl FakeStore {
    /// Fail the next `count` bulk inserts
    pub fn fail_inserts(&self, count: usize) {
        self.state.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn with_products(self, rows: Vec<ProductRow>) -> Self {
        *self.state.products.lock().unwrap() = rows;
        self
    }

    /// Names returned for the existing-destinations query; unset means the
    /// hub table does not exist
    pub fn with_existing(self, names: &[&str]) -> Self {
        *self.state.existing.lock().unwrap() = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn inserts(&self) -> Vec<Vec<StagingRow>> {
        self.state.inserts.lock().unwrap().clone()
    }

    pub fn rows(&self) -> Vec<StagingRow> {
        self.inserts().into_iter().flatten().collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().unwrap().clone()
    }

    pub fn insert_attempts(&self) -> usize {
        self.state.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn pool(&self, size: usize) -> Arc<ClientPool<FakeStore>> {
        let clients = (0..size).map(|_| self.clone()).collect();
        Arc::new(ClientPool::new("fake", clients, Duration::from_secs(1)).expect("non-empty pool"))
    }
}

#[async_trait]
impl StoreClient for FakeStore {
    async fn bulk_insert(&self, _table: &str, rows: &[StagingRow]) -> Result<()> {
        self.state.insert_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .state
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::ClickHouse("Timeout while writing to socket".to_string()));
        }
        self.state.inserts.lock().unwrap().push(rows.to_vec());
        Ok(())
    }

    async fn fetch_products(&self, sql: &str) -> Result<Vec<ProductRow>> {
        self.state.queries.lock().unwrap().push(sql.to_string());
        Ok(self.state.products.lock().unwrap().clone())
    }

    async fn fetch_strings(&self, sql: &str) -> Result<Vec<String>> {
        self.state.queries.lock().unwrap().push(sql.to_string());
        self.state
            .existing
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PipelineError::ClickHouse("Table edw.hub_deal doesn't exist".to_string()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
