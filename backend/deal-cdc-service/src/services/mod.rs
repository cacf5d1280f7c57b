pub mod backfill;
pub mod cdc;
pub mod filters;
pub mod integrity;
pub mod keys;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod writer;

pub use backfill::{BackfillReport, InitialLoader};
pub use integrity::{IntegrityManager, ValidationSummary};
pub use pipeline::{BatchPolicy, CdcPipeline, PipelineState, RunOutcome, RunSummary};
pub use source::{ChangeSource, CommitPosition, KafkaChangeSource, SourceEvent, SourcePosition};
pub use store::{ClickHouseStore, StoreClient};
pub use writer::{BatchWriter, CommitReport};
