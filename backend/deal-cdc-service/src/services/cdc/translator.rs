use std::sync::Arc;
use tracing::debug;

use super::models::{resolve_change_timestamp, ChangeRecord, RawChangeEvent, RecordSource};
use crate::error::{DuplicateTier, RecordRejection};
use crate::services::filters::FilterEngine;
use crate::services::integrity::IntegrityManager;

/// Turns raw change events into destination-tagged change records
pub struct ChangeTranslator {
    integrity: Arc<IntegrityManager>,
}

impl ChangeTranslator {
    pub fn new(integrity: Arc<IntegrityManager>) -> Self {
        Self { integrity }
    }

    /// Translate one event.
    ///
    /// Deletes yield one identifier-only record. Upserts are validated and
    /// checked against dedup history before routing, then fan out to one
    /// record per matching destination.
    pub fn translate(
        &self,
        event: &RawChangeEvent,
        rules: &FilterEngine,
    ) -> Result<Vec<ChangeRecord>, RecordRejection> {
        let event_time = event.timestamp();

        if event.operation.is_delete() {
            let before = event
                .before
                .as_ref()
                .filter(|image| image.product_id().is_some())
                .ok_or(RecordRejection::MissingImage)?;
            let change_timestamp = resolve_change_timestamp(before, event_time);
            return Ok(vec![ChangeRecord::delete(before, change_timestamp)]);
        }

        let after = event.after.as_ref().ok_or(RecordRejection::MissingImage)?;
        self.integrity.check(after)?;

        if self.integrity.is_duplicate_image(after) {
            debug!(product_id = ?after.product_id(), "Duplicate image, skipping");
            return Err(RecordRejection::Duplicate(DuplicateTier::History));
        }

        let destinations = rules.matching_destinations(after);
        if destinations.is_empty() {
            debug!(product_id = ?after.product_id(), "Record matches no destination");
            return Err(RecordRejection::Unmatched);
        }

        let change_timestamp = resolve_change_timestamp(after, event_time);
        debug!(
            product_id = ?after.product_id(),
            destinations = ?destinations,
            "Record matched destinations"
        );
        Ok(destinations
            .iter()
            .map(|destination| {
                ChangeRecord::upsert(
                    after.clone(),
                    destination,
                    event.operation,
                    change_timestamp,
                    RecordSource::CdcKafka,
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cdc::{CdcOperation, ProductImage};
    use crate::services::filters::{DestinationRuleSet, FilterCondition, FilterOperator};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn engine() -> FilterEngine {
        let mut destinations = BTreeMap::new();
        for (name, category) in [("Deal A", "Skincare"), ("Deal B", "Skincare"), ("Deal C", "Skincare"), ("Makeup", "Makeup")] {
            destinations.insert(
                name.to_string(),
                vec![FilterCondition::new("category", FilterOperator::Equals, category)],
            );
        }
        FilterEngine::new(DestinationRuleSet::new(destinations))
    }

    fn translator() -> ChangeTranslator {
        ChangeTranslator::new(Arc::new(IntegrityManager::new(1000)))
    }

    fn image(value: serde_json::Value) -> ProductImage {
        serde_json::from_value(value).unwrap()
    }

    fn product(id: i64) -> ProductImage {
        image(json!({
            "product_base_id": id,
            "product_name": "Serum",
            "category": "Skincare",
            "price": 150000,
            "revenue": 9000,
            "month": "2024-03"
        }))
    }

    fn event(operation: CdcOperation, before: Option<ProductImage>, after: Option<ProductImage>) -> RawChangeEvent {
        RawChangeEvent {
            operation,
            before,
            after,
            ts_ms: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn test_fans_out_to_every_matching_destination() {
        let records = translator()
            .translate(&event(CdcOperation::Update, None, Some(product(1))), &engine())
            .unwrap();

        assert_eq!(records.len(), 3);
        let names: Vec<_> = records.iter().filter_map(|r| r.destination_name.clone()).collect();
        assert_eq!(names, vec!["Deal A", "Deal B", "Deal C"]);

        let keys: Vec<_> = records.iter().map(|r| r.keys.unwrap()).collect();
        assert!(keys.iter().all(|k| k.product_key == keys[0].product_key));
        assert!(keys.iter().all(|k| k.product_change_fingerprint == keys[0].product_change_fingerprint));
        assert_ne!(keys[0].product_destination_key, keys[1].product_destination_key);
        assert!(records.iter().all(|r| r.operation == CdcOperation::Update));
        assert!(records.iter().all(|r| r.record_source == RecordSource::CdcKafka));
    }

    #[test]
    fn test_delete_emits_single_record() {
        let records = translator()
            .translate(&event(CdcOperation::Delete, Some(product(4)), None), &engine())
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_delete());
        assert!(records[0].destination_name.is_none());
        assert_eq!(records[0].product_id(), Some(4));
    }

    #[test]
    fn test_delete_without_identifier_is_rejected() {
        let result = translator().translate(
            &event(CdcOperation::Delete, Some(image(json!({"product_name": "x"}))), None),
            &engine(),
        );
        assert_eq!(result.unwrap_err(), RecordRejection::MissingImage);
    }

    #[test]
    fn test_upsert_without_after_image() {
        let result = translator().translate(&event(CdcOperation::Create, None, None), &engine());
        assert_eq!(result.unwrap_err(), RecordRejection::MissingImage);
    }

    #[test]
    fn test_invalid_record_dropped_before_routing() {
        let result = translator().translate(
            &event(CdcOperation::Create, None, Some(image(json!({"product_base_id": 1, "category": "Skincare"})))),
            &engine(),
        );
        assert!(matches!(result, Err(RecordRejection::Invalid(_))));
    }

    #[test]
    fn test_redelivered_image_is_duplicate() {
        let translator = translator();
        let rules = engine();
        let change = event(CdcOperation::Create, None, Some(product(2)));

        assert_eq!(translator.translate(&change, &rules).unwrap().len(), 3);
        assert_eq!(
            translator.translate(&change, &rules).unwrap_err(),
            RecordRejection::Duplicate(DuplicateTier::History)
        );
    }

    #[test]
    fn test_unmatched_record() {
        let after = image(json!({
            "product_base_id": 3,
            "product_name": "Atlas",
            "category": "Books",
            "price": 1,
            "revenue": 1,
            "month": "2024-03"
        }));
        let result = translator().translate(&event(CdcOperation::Read, None, Some(after)), &engine());
        assert_eq!(result.unwrap_err(), RecordRejection::Unmatched);
    }
}
