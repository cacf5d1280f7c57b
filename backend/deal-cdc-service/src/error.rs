use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient write error: {0}")]
    TransientWrite(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("ClickHouse error: {0}")]
    ClickHouse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] ch_pool::PoolError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Errors that must stop the run before (or instead of) consuming.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_) | PipelineError::UpstreamUnavailable(_)
        )
    }

    /// Errors that only fail the current commit; a later run may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientWrite(_) | PipelineError::ClickHouse(_) | PipelineError::Pool(_)
        )
    }
}

impl From<rdkafka::error::KafkaError> for PipelineError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        PipelineError::Kafka(err.to_string())
    }
}

impl From<clickhouse::error::Error> for PipelineError {
    fn from(err: clickhouse::error::Error) -> Self {
        PipelineError::ClickHouse(err.to_string())
    }
}

/// Which dedup tier caught a repeated record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateTier {
    Batch,
    History,
}

/// Why a single record was dropped. Never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRejection {
    /// Upsert without an after-image, or delete without a product id
    MissingImage,
    /// Payload could not be decoded as a change event
    Malformed(String),
    /// Required field absent, null, or not numeric
    Invalid(String),
    Duplicate(DuplicateTier),
    /// Valid record that no destination selects
    Unmatched,
}

impl RecordRejection {
    /// Stable label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            RecordRejection::MissingImage => "missing_image",
            RecordRejection::Malformed(_) => "malformed",
            RecordRejection::Invalid(_) => "invalid",
            RecordRejection::Duplicate(DuplicateTier::Batch) => "duplicate_batch",
            RecordRejection::Duplicate(DuplicateTier::History) => "duplicate_history",
            RecordRejection::Unmatched => "unmatched",
        }
    }
}

impl fmt::Display for RecordRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRejection::MissingImage => write!(f, "missing record image"),
            RecordRejection::Malformed(msg) => write!(f, "malformed payload: {}", msg),
            RecordRejection::Invalid(msg) => write!(f, "invalid record: {}", msg),
            RecordRejection::Duplicate(tier) => write!(f, "duplicate ({:?} tier)", tier),
            RecordRejection::Unmatched => write!(f, "no matching destination"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_and_transient_classification() {
        assert!(PipelineError::Configuration("empty rules".into()).is_fatal());
        assert!(PipelineError::UpstreamUnavailable("no topic".into()).is_fatal());
        assert!(!PipelineError::TransientWrite("chunk 2".into()).is_fatal());

        assert!(PipelineError::TransientWrite("chunk 2".into()).is_transient());
        assert!(PipelineError::ClickHouse("timeout".into()).is_transient());
        assert!(!PipelineError::Validation("price".into()).is_transient());
    }
}
