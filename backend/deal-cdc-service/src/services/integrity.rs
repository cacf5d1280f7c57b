//! Record validation and two-tier duplicate suppression
//!
//! The history tier is a bounded set of fingerprints shared by the whole
//! pipeline. When it is full it is cleared wholesale rather than evicted
//! entry by entry, so a record seen just before a clear is accepted again.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{DuplicateTier, RecordRejection};
use crate::metrics::helpers;
use crate::services::cdc::models::{CATEGORY, MONTH, PRICE, PRODUCT_ID, PRODUCT_NAME, REVENUE};
use crate::services::cdc::{ChangeRecord, ProductImage};

const REQUIRED_FIELDS: [&str; 6] = [PRODUCT_ID, PRODUCT_NAME, CATEGORY, PRICE, REVENUE, MONTH];

/// Counts produced by one `validate_batch` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub received: usize,
    pub accepted: usize,
    pub invalid: usize,
    pub duplicate_in_batch: usize,
    pub duplicate_in_history: usize,
}

impl ValidationSummary {
    pub fn merge(&mut self, other: &ValidationSummary) {
        self.received += other.received;
        self.accepted += other.accepted;
        self.invalid += other.invalid;
        self.duplicate_in_batch += other.duplicate_in_batch;
        self.duplicate_in_history += other.duplicate_in_history;
    }
}

#[derive(Debug, Default)]
pub struct ValidatedBatch {
    /// Accepted records in input order
    pub accepted: Vec<ChangeRecord>,
    pub summary: ValidationSummary,
}

struct DedupCache {
    seen: HashSet<String>,
    cap: usize,
}

impl DedupCache {
    /// Returns true if `fingerprint` was already present, otherwise marks it.
    fn check_and_insert(&mut self, fingerprint: String) -> bool {
        if self.seen.contains(&fingerprint) {
            return true;
        }
        if self.seen.len() >= self.cap {
            info!(cap = self.cap, "Dedup cache full, clearing");
            self.seen.clear();
        }
        self.seen.insert(fingerprint);
        false
    }
}

pub struct IntegrityManager {
    history: Mutex<DedupCache>,
}

impl IntegrityManager {
    pub fn new(cache_cap: usize) -> Self {
        Self {
            history: Mutex::new(DedupCache {
                seen: HashSet::new(),
                cap: cache_cap.max(1),
            }),
        }
    }

    /// Required fields present and non-null; id, price and revenue numeric.
    pub fn check(&self, image: &ProductImage) -> Result<(), RecordRejection> {
        for field in REQUIRED_FIELDS {
            if image.get(field).is_none() {
                return Err(RecordRejection::Invalid(format!("missing required field {}", field)));
            }
        }
        if image.product_id().is_none() {
            return Err(RecordRejection::Invalid(format!("{} is not an integer", PRODUCT_ID)));
        }
        for field in [PRICE, REVENUE] {
            if image.number(field).is_none() {
                return Err(RecordRejection::Invalid(format!("{} is not numeric", field)));
            }
        }
        Ok(())
    }

    pub fn is_valid(&self, record: &ChangeRecord) -> bool {
        self.check(&record.attributes).is_ok()
    }

    /// MD5 hex over canonical JSON of the normalized fields
    pub fn fingerprint(&self, record: &ChangeRecord) -> String {
        fingerprint_fields(
            &record.attributes,
            record.destination_name.as_deref(),
            Some(record.operation.code()),
        )
    }

    /// Fingerprint of a bare image, before destination routing
    pub fn fingerprint_image(&self, image: &ProductImage) -> String {
        fingerprint_fields(image, None, None)
    }

    /// History-tier check. Marks the record as seen when it is novel.
    pub fn is_duplicate(&self, record: &ChangeRecord) -> bool {
        self.check_history(self.fingerprint(record))
    }

    pub fn is_duplicate_image(&self, image: &ProductImage) -> bool {
        self.check_history(self.fingerprint_image(image))
    }

    /// Validate, then dedup within the batch, then dedup against history.
    pub fn validate_batch(&self, records: Vec<ChangeRecord>) -> ValidatedBatch {
        let mut summary = ValidationSummary {
            received: records.len(),
            ..Default::default()
        };
        let mut seen_in_batch = HashSet::with_capacity(records.len());
        let mut accepted = Vec::with_capacity(records.len());

        for record in records {
            if let Err(rejection) = self.check(&record.attributes) {
                debug!(product_id = ?record.product_id(), %rejection, "Record failed validation");
                helpers::record_rejection(rejection.reason());
                summary.invalid += 1;
                continue;
            }

            let fingerprint = self.fingerprint(&record);
            if seen_in_batch.contains(&fingerprint) {
                helpers::record_rejection(RecordRejection::Duplicate(DuplicateTier::Batch).reason());
                summary.duplicate_in_batch += 1;
                continue;
            }

            if self.check_history(fingerprint.clone()) {
                helpers::record_rejection(RecordRejection::Duplicate(DuplicateTier::History).reason());
                summary.duplicate_in_history += 1;
                continue;
            }

            seen_in_batch.insert(fingerprint);
            accepted.push(record);
        }

        summary.accepted = accepted.len();
        debug!(
            accepted = summary.accepted,
            received = summary.received,
            "Validated batch"
        );
        ValidatedBatch { accepted, summary }
    }

    pub fn cache_len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .seen
            .len()
    }

    fn check_history(&self, fingerprint: String) -> bool {
        let mut cache = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let duplicate = cache.check_and_insert(fingerprint);
        helpers::set_dedup_cache_size(cache.seen.len());
        duplicate
    }
}

fn fingerprint_fields(
    image: &ProductImage,
    destination: Option<&str>,
    operation: Option<&str>,
) -> String {
    let field = |name: &str| image.get(name).cloned().unwrap_or(Value::Null);
    let text = |value: Option<&str>| value.map(|v| Value::String(v.to_string())).unwrap_or(Value::Null);

    let mut normalized = BTreeMap::new();
    normalized.insert("deal_name", text(destination));
    normalized.insert("month", field(MONTH));
    normalized.insert("operation_type", text(operation));
    normalized.insert("price", field(PRICE));
    normalized.insert("product_base_id", field(PRODUCT_ID));
    normalized.insert("product_name", field(PRODUCT_NAME));
    normalized.insert("revenue", field(REVENUE));

    let canonical = serde_json::to_string(&normalized).unwrap_or_default();
    format!("{:x}", md5::compute(canonical.as_bytes()))
}
