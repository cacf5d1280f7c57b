pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod services;

pub use config::{KafkaConfig, PipelineConfig};
pub use error::{PipelineError, RecordRejection, Result};
