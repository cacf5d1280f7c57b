//! Ingestion loop
//!
//! Pulls change events, translates them into a batch bounded by record count
//! and wall-clock age, and flushes the batch through the [`BatchWriter`]. The
//! source position is committed only after a fully successful write. After any
//! failed flush the position is held for the rest of the run, so the next run
//! re-reads everything from the last good commit.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, RecordRejection, Result};
use crate::metrics::helpers::{self, FlushTimer};
use crate::services::cdc::{ChangeRecord, ChangeTranslator};
use crate::services::filters::{FilterEngine, RuleSource};
use crate::services::integrity::{IntegrityManager, ValidationSummary};
use crate::services::source::{ChangeSource, CommitPosition, SourceEvent, TopicInfo};
use crate::services::store::StoreClient;
use crate::services::writer::BatchWriter;

/// Batch bounds and loop timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_records: usize,
    pub max_wait: Duration,
    pub poll_timeout: Duration,
    /// Bounds accumulation for the whole run
    pub processing_timeout: Duration,
    pub rules_reload: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Accumulating,
    Flushing,
    Committed,
    Failed,
    Stopped,
}

/// Per-record outcomes over a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub records_translated: usize,
    pub missing_image: usize,
    pub malformed: usize,
    pub invalid: usize,
    pub duplicate: usize,
    pub unmatched: usize,
}

impl BatchStats {
    fn record(&mut self, rejection: &RecordRejection) {
        match rejection {
            RecordRejection::MissingImage => self.missing_image += 1,
            RecordRejection::Malformed(_) => self.malformed += 1,
            RecordRejection::Invalid(_) => self.invalid += 1,
            RecordRejection::Duplicate(_) => self.duplicate += 1,
            RecordRejection::Unmatched => self.unmatched += 1,
        }
    }

    pub fn rejected(&self) -> usize {
        self.missing_image + self.malformed + self.invalid + self.duplicate + self.unmatched
    }
}

/// How a run ended, as operators see it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunOutcome {
    /// Nothing to do
    #[default]
    Idle,
    /// Every flushed batch was written and committed
    Committed,
    /// At least one batch failed; the position is behind what was pulled
    Stalled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub batches_committed: usize,
    pub batches_failed: usize,
    /// Written successfully while the position was held
    pub batches_held: usize,
    pub events_pulled: usize,
    pub records_written: usize,
    pub stats: BatchStats,
    pub validation: ValidationSummary,
}

impl RunSummary {
    fn finish(&mut self) {
        self.outcome = if self.batches_failed > 0 {
            RunOutcome::Stalled
        } else if self.batches_committed > 0 {
            RunOutcome::Committed
        } else {
            RunOutcome::Idle
        };
    }
}

#[derive(Default)]
struct Batch {
    records: Vec<ChangeRecord>,
    cursor: CommitPosition,
    started: Option<Instant>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.cursor.is_empty()
    }

    fn age(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

pub struct CdcPipeline<S, C> {
    source: S,
    writer: BatchWriter<C>,
    translator: ChangeTranslator,
    rules: Arc<FilterEngine>,
    rule_source: Option<Arc<dyn RuleSource>>,
    policy: BatchPolicy,
    state: PipelineState,
    position_held: bool,
}

impl<S: ChangeSource, C: StoreClient> CdcPipeline<S, C> {
    /// `integrity` must be the same manager the writer validates with.
    pub fn new(
        source: S,
        writer: BatchWriter<C>,
        integrity: Arc<IntegrityManager>,
        rules: Arc<FilterEngine>,
        policy: BatchPolicy,
    ) -> Self {
        Self {
            source,
            writer,
            translator: ChangeTranslator::new(integrity),
            rules,
            rule_source: None,
            policy,
            state: PipelineState::Idle,
            position_held: false,
        }
    }

    /// Reload rules from `source` every `policy.rules_reload`
    pub fn with_rule_source(mut self, source: Arc<dyn RuleSource>) -> Self {
        self.rule_source = Some(source);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Pre-flight gate: the source must be reachable and the topic present.
    pub async fn preflight(&self) -> Result<TopicInfo> {
        self.source.describe_topic().await.map_err(|e| match e {
            PipelineError::UpstreamUnavailable(_) => e,
            other => PipelineError::UpstreamUnavailable(other.to_string()),
        })
    }

    /// Run until the processing timeout or a shutdown signal, then flush once more.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<RunSummary> {
        let deadline = Instant::now() + self.policy.processing_timeout;
        let mut summary = RunSummary::default();
        let mut batch = Batch::default();
        let mut last_reload = Instant::now();
        let mut upstream_error = None;

        self.state = PipelineState::Accumulating;
        info!(
            max_records = self.policy.max_records,
            max_wait_secs = self.policy.max_wait.as_secs(),
            timeout_secs = self.policy.processing_timeout.as_secs(),
            "CDC pipeline started"
        );

        loop {
            if Instant::now() >= deadline {
                info!("Processing timeout reached, finishing current batch");
                break;
            }
            self.reload_rules_if_due(&mut last_reload).await;

            let pulled = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutdown requested, finishing current batch");
                    break;
                }
                pulled = self.source.pull(self.policy.max_records, self.policy.poll_timeout) => pulled,
            };

            let events = match pulled {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to pull change events: {}", e);
                    upstream_error = Some(e);
                    break;
                }
            };

            for event in events {
                self.accept(event, &mut batch, &mut summary);
                if batch.records.len() >= self.policy.max_records {
                    self.flush(&mut batch, &mut summary).await;
                }
            }

            if !batch.is_empty() && batch.age() >= self.policy.max_wait {
                debug!(age_ms = batch.age().as_millis() as u64, "Batch wait exceeded");
                self.flush(&mut batch, &mut summary).await;
            }
        }

        self.flush(&mut batch, &mut summary).await;
        self.state = PipelineState::Stopped;
        summary.finish();

        info!(
            outcome = ?summary.outcome,
            events = summary.events_pulled,
            written = summary.records_written,
            committed = summary.batches_committed,
            failed = summary.batches_failed,
            rejected = summary.stats.rejected(),
            "CDC pipeline stopped"
        );

        match upstream_error {
            Some(PipelineError::UpstreamUnavailable(msg)) | Some(PipelineError::Kafka(msg)) => {
                Err(PipelineError::UpstreamUnavailable(msg))
            }
            Some(other) => Err(other),
            None => Ok(summary),
        }
    }

    /// Translate one event into the batch and cover its position.
    fn accept(&mut self, source_event: SourceEvent, batch: &mut Batch, summary: &mut RunSummary) {
        summary.events_pulled += 1;
        self.state = PipelineState::Accumulating;

        let translated = match &source_event.event {
            Ok(event) => {
                helpers::record_event(event.operation.code());
                self.translator.translate(event, &self.rules)
            }
            Err(rejection) => {
                helpers::record_event("undecodable");
                Err(rejection.clone())
            }
        };

        match translated {
            Ok(records) => {
                summary.stats.records_translated += records.len();
                batch.records.extend(records);
            }
            Err(rejection) => {
                match &rejection {
                    RecordRejection::Invalid(_) | RecordRejection::Malformed(_) => {
                        warn!(partition = source_event.position.partition, offset = source_event.position.offset, %rejection, "Dropped change event")
                    }
                    _ => debug!(offset = source_event.position.offset, %rejection, "Skipped change event"),
                }
                helpers::record_rejection(rejection.reason());
                summary.stats.record(&rejection);
            }
        }

        if batch.started.is_none() {
            batch.started = Some(Instant::now());
        }
        batch.cursor.advance(source_event.position);
    }

    async fn flush(&mut self, batch: &mut Batch, summary: &mut RunSummary) {
        if batch.is_empty() {
            return;
        }
        self.state = PipelineState::Flushing;
        let timer = FlushTimer::start();

        let records = std::mem::take(&mut batch.records);
        let cursor = std::mem::take(&mut batch.cursor);
        batch.started = None;
        let batch_len = records.len();

        let report = self.writer.commit(records).await;
        summary.validation.merge(&report.summary);

        if !report.success {
            let failed: Vec<&str> = report
                .groups
                .iter()
                .filter(|g| !g.succeeded())
                .map(|g| g.destination.as_str())
                .collect();
            error!(
                records = batch_len,
                retryable = report.retryable,
                failed_destinations = ?failed,
                "Batch commit failed, source position not advanced"
            );
            self.position_held = true;
            self.state = PipelineState::Failed;
            summary.batches_failed += 1;
            timer.finish("failed");
            return;
        }

        summary.records_written += report.rows_written;

        if self.position_held {
            warn!(
                records = batch_len,
                "Batch written but position held after an earlier failure"
            );
            self.state = PipelineState::Failed;
            summary.batches_held += 1;
            timer.finish("held");
            return;
        }

        match self.source.commit_position(&cursor).await {
            Ok(()) => {
                self.state = PipelineState::Committed;
                summary.batches_committed += 1;
                timer.finish("committed");
                info!(records = batch_len, written = report.rows_written, "Processed and committed batch");
            }
            Err(e) => {
                error!("Failed to commit source position: {}", e);
                self.position_held = true;
                self.state = PipelineState::Failed;
                summary.batches_failed += 1;
                timer.finish("failed");
            }
        }
    }

    async fn reload_rules_if_due(&self, last_reload: &mut Instant) {
        let (Some(every), Some(source)) = (self.policy.rules_reload, &self.rule_source) else {
            return;
        };
        if last_reload.elapsed() < every {
            return;
        }
        *last_reload = Instant::now();
        match source.load().await {
            Ok(rules) => self.rules.reload(rules),
            Err(e) => warn!("Rule reload failed, keeping previous rules: {}", e),
        }
    }
}
