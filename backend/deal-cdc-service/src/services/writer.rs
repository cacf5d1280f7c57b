//! Batch router and parallel chunk writer
//!
//! Deletes are routed to a count-only delete path. Upserts are validated,
//! grouped by destination, cut into chunks and written concurrently. The
//! commit result is reported only after every chunk has finished.

use ch_pool::ClientPool;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::metrics::helpers;
use crate::services::cdc::ChangeRecord;
use crate::services::integrity::{IntegrityManager, ValidationSummary};
use crate::services::store::{StagingRow, StoreClient};

/// Outcome for one destination group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOutcome {
    pub destination: String,
    pub records: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
    /// Failed chunks whose error a later run cannot fix
    pub permanent_failures: usize,
}

impl GroupOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed_chunks == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    /// False if any chunk write failed
    pub success: bool,
    /// False if any chunk failed with a non-transient error
    pub retryable: bool,
    pub groups: Vec<GroupOutcome>,
    pub deletes_routed: usize,
    pub rows_written: usize,
    pub summary: ValidationSummary,
}

pub struct BatchWriter<C> {
    pool: Arc<ClientPool<C>>,
    integrity: Arc<IntegrityManager>,
    table: String,
    chunk_size: usize,
    permits: Semaphore,
}

impl<C: StoreClient> BatchWriter<C> {
    pub fn new(
        pool: Arc<ClientPool<C>>,
        integrity: Arc<IntegrityManager>,
        table: impl Into<String>,
        chunk_size: usize,
        parallelism: usize,
    ) -> Self {
        Self {
            pool,
            integrity,
            table: table.into(),
            chunk_size: chunk_size.max(1),
            permits: Semaphore::new(parallelism.max(1)),
        }
    }

    pub async fn commit(&self, records: Vec<ChangeRecord>) -> CommitReport {
        let (deletes, upserts): (Vec<_>, Vec<_>) =
            records.into_iter().partition(ChangeRecord::is_delete);

        let deletes_routed = self.route_deletes(&deletes);

        let validated = self.integrity.validate_batch(upserts);
        let groups = group_by_destination(validated.accepted);

        let mut writes = Vec::new();
        for (destination, records) in &groups {
            for (index, chunk) in records.chunks(self.chunk_size).enumerate() {
                writes.push(async move {
                    let result = self.write_chunk(destination, index, chunk).await;
                    (destination.as_str(), result)
                });
            }
        }

        // Barrier: every chunk finishes before the outcome is known
        let results = join_all(writes).await;

        let mut outcomes: BTreeMap<&str, GroupOutcome> = groups
            .iter()
            .map(|(destination, records)| {
                (
                    destination.as_str(),
                    GroupOutcome {
                        destination: destination.clone(),
                        records: records.len(),
                        chunks: 0,
                        failed_chunks: 0,
                        permanent_failures: 0,
                    },
                )
            })
            .collect();

        let mut rows_written = 0;
        for (destination, result) in results {
            let Some(outcome) = outcomes.get_mut(destination) else {
                continue;
            };
            outcome.chunks += 1;
            match result {
                Ok(rows) => rows_written += rows,
                Err(e) => {
                    outcome.failed_chunks += 1;
                    if !e.is_transient() {
                        outcome.permanent_failures += 1;
                    }
                }
            }
        }

        let groups: Vec<GroupOutcome> = outcomes.into_values().collect();
        let success = groups.iter().all(GroupOutcome::succeeded);
        let retryable = groups.iter().all(|g| g.permanent_failures == 0);

        info!(
            success,
            retryable,
            destinations = groups.len(),
            rows_written,
            deletes_routed,
            rejected = validated.summary.received - validated.summary.accepted,
            "Batch commit finished"
        );

        CommitReport {
            success,
            retryable,
            groups,
            deletes_routed,
            rows_written,
            summary: validated.summary,
        }
    }

    async fn write_chunk(&self, destination: &str, index: usize, chunk: &[ChangeRecord]) -> Result<usize> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| PipelineError::Internal(format!("Failed to acquire write permit: {}", e)))?;

        let rows: Vec<StagingRow> = chunk
            .iter()
            .map(|record| {
                let keys = record.attributes.surrogate_keys(destination);
                if record.keys.is_some_and(|existing| existing != keys) {
                    warn!(
                        destination = %destination,
                        product_id = ?record.product_id(),
                        "Surrogate keys differ from translation, using recomputed keys"
                    );
                }
                StagingRow::from_record(record, keys)
            })
            .collect();

        let result: Result<()> = async {
            // Leased for this chunk only, returned on drop
            let client = self.pool.acquire().await?;
            client.bulk_insert(&self.table, &rows).await
        }
        .await;

        helpers::record_chunk_write(result.is_ok());
        match result {
            Ok(()) => {
                debug!(destination = %destination, chunk = index, rows = rows.len(), "Chunk written");
                Ok(rows.len())
            }
            Err(e) if e.is_transient() => {
                error!(destination = %destination, chunk = index, rows = rows.len(), error = %e, "Chunk write failed");
                Err(PipelineError::TransientWrite(format!(
                    "{} chunk {}: {}",
                    destination, index, e
                )))
            }
            Err(e) => {
                error!(destination = %destination, chunk = index, rows = rows.len(), error = %e, "Chunk rejected by store");
                Err(e)
            }
        }
    }

    /// Deletes are handled downstream; this only routes and counts them.
    fn route_deletes(&self, deletes: &[ChangeRecord]) -> usize {
        if !deletes.is_empty() {
            let ids: Vec<i64> = deletes.iter().filter_map(ChangeRecord::product_id).collect();
            info!(count = deletes.len(), "Routed delete records");
            debug!(product_ids = ?ids, "Delete record ids");
        }
        deletes.len()
    }
}

/// Group by destination, keeping input order within each group
fn group_by_destination(records: Vec<ChangeRecord>) -> BTreeMap<String, Vec<ChangeRecord>> {
    let mut groups: BTreeMap<String, Vec<ChangeRecord>> = BTreeMap::new();
    for record in records {
        let destination = record.destination_name.clone().unwrap_or_else(|| "unknown".to_string());
        groups.entry(destination).or_default().push(record);
    }
    groups
}
