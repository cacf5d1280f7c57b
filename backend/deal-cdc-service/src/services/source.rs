use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{PipelineError, RecordRejection, Result};
use crate::services::cdc::RawChangeEvent;

/// Location of one message in the upstream log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourcePosition {
    pub partition: i32,
    pub offset: i64,
}

/// A pulled message. Undecodable payloads still carry their position so the
/// cursor can move past them.
#[derive(Debug, Clone)]
pub struct SourceEvent {
    pub position: SourcePosition,
    pub event: std::result::Result<RawChangeEvent, RecordRejection>,
}

/// Next offset to read, per partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPosition {
    next: BTreeMap<i32, i64>,
}

impl CommitPosition {
    /// Cover `position`: the next offset becomes at least `offset + 1`.
    pub fn advance(&mut self, position: SourcePosition) {
        let next = self.next.entry(position.partition).or_insert(position.offset + 1);
        *next = (*next).max(position.offset + 1);
    }

    pub fn next_offset(&self, partition: i32) -> Option<i64> {
        self.next.get(&partition).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.next.iter().map(|(partition, offset)| (*partition, *offset))
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition: i32,
    pub low: i64,
    pub high: i64,
}

/// Pre-flight view of the upstream topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub topic: String,
    pub partitions: Vec<PartitionInfo>,
}

impl TopicInfo {
    /// Messages currently retained across all partitions
    pub fn total_messages(&self) -> i64 {
        self.partitions
            .iter()
            .map(|p| (p.high - p.low).max(0))
            .sum()
    }
}

/// Upstream change log
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Pull up to `max_items` events, waiting at most `max_wait`
    async fn pull(&self, max_items: usize, max_wait: Duration) -> Result<Vec<SourceEvent>>;

    /// Durably record that everything before `position` is processed
    async fn commit_position(&self, position: &CommitPosition) -> Result<()>;

    /// Verify the source is reachable and the topic exists
    async fn describe_topic(&self) -> Result<TopicInfo>;
}

/// [`ChangeSource`] over a Kafka topic of Debezium change events
pub struct KafkaChangeSource {
    consumer: StreamConsumer,
    topic: String,
    metadata_timeout: Duration,
}

impl KafkaChangeSource {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        info!(
            brokers = %config.bootstrap_servers,
            topic = %config.topic,
            group_id = %config.group_id,
            "Initializing Kafka change source"
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", "10000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                PipelineError::UpstreamUnavailable(e.to_string())
            })?;

        consumer.subscribe(&[config.topic.as_str()]).map_err(|e| {
            error!("Failed to subscribe to topic {}: {}", config.topic, e);
            PipelineError::UpstreamUnavailable(e.to_string())
        })?;

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            metadata_timeout: Duration::from_millis(config.metadata_timeout_ms),
        })
    }
}

#[async_trait]
impl ChangeSource for KafkaChangeSource {
    async fn pull(&self, max_items: usize, max_wait: Duration) -> Result<Vec<SourceEvent>> {
        let deadline = Instant::now() + max_wait;
        let mut events = Vec::new();

        while events.len() < max_items {
            let message = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => message,
                Ok(Err(e)) if events.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    // Keep what was received; later offsets must not be committed past them
                    warn!("Kafka receive error after {} events: {}", events.len(), e);
                    break;
                }
            };

            let position = SourcePosition {
                partition: message.partition(),
                offset: message.offset(),
            };
            let event = match message.payload() {
                None => Err(RecordRejection::MissingImage),
                Some(bytes) => RawChangeEvent::decode(bytes).map_err(|e| {
                    warn!(
                        partition = position.partition,
                        offset = position.offset,
                        "Undecodable change event: {}",
                        e
                    );
                    RecordRejection::Malformed(e.to_string())
                }),
            };
            events.push(SourceEvent { position, event });
        }

        debug!(count = events.len(), "Pulled change events");
        Ok(events)
    }

    async fn commit_position(&self, position: &CommitPosition) -> Result<()> {
        if position.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (partition, next) in position.iter() {
            list.add_partition_offset(&self.topic, partition, Offset::Offset(next))?;
        }

        self.consumer.commit(&list, CommitMode::Sync).map_err(|e| {
            error!("Failed to commit offsets: {}", e);
            PipelineError::Kafka(e.to_string())
        })?;

        info!(topic = %self.topic, partitions = list.count(), "Committed source position");
        Ok(())
    }

    async fn describe_topic(&self) -> Result<TopicInfo> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(self.topic.as_str()), self.metadata_timeout)
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("metadata: {}", e)))?;

        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .filter(|t| t.error().is_none() && !t.partitions().is_empty())
            .ok_or_else(|| {
                PipelineError::UpstreamUnavailable(format!("topic {} does not exist", self.topic))
            })?;

        let mut partitions = Vec::with_capacity(topic.partitions().len());
        for partition in topic.partitions() {
            let (low, high) = self
                .consumer
                .fetch_watermarks(&self.topic, partition.id(), self.metadata_timeout)
                .map_err(|e| PipelineError::UpstreamUnavailable(format!("watermarks: {}", e)))?;
            partitions.push(PartitionInfo {
                partition: partition.id(),
                low,
                high,
            });
        }

        let info = TopicInfo {
            topic: self.topic.clone(),
            partitions,
        };
        info!(
            topic = %info.topic,
            partitions = info.partitions.len(),
            total_messages = info.total_messages(),
            "Topic metadata fetched"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_position_tracks_next_offset() {
        let mut position = CommitPosition::default();
        position.advance(SourcePosition { partition: 0, offset: 10 });
        position.advance(SourcePosition { partition: 0, offset: 7 });
        position.advance(SourcePosition { partition: 2, offset: 0 });

        assert_eq!(position.next_offset(0), Some(11));
        assert_eq!(position.next_offset(2), Some(1));
        assert_eq!(position.next_offset(1), None);
        assert!(!position.is_empty());
    }

    #[test]
    fn test_topic_total_messages() {
        let info = TopicInfo {
            topic: "edw_cdc.product_changes_log".to_string(),
            partitions: vec![
                PartitionInfo { partition: 0, low: 5, high: 15 },
                PartitionInfo { partition: 1, low: 0, high: 0 },
            ],
        };
        assert_eq!(info.total_messages(), 10);
    }

    #[tokio::test]
    #[ignore] // Requires Kafka on localhost:9092
    async fn test_kafka_describe_topic_reports_missing_topic() {
        let config = KafkaConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            topic: "deal_cdc_missing_topic".to_string(),
            group_id: "deal-cdc-test".to_string(),
            session_timeout_ms: 10_000,
            metadata_timeout_ms: 2_000,
        };
        let source = KafkaChangeSource::new(&config).unwrap();
        assert!(matches!(source.describe_topic().await, Err(PipelineError::UpstreamUnavailable(_))));
    }
}
