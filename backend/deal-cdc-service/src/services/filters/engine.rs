use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::info;

use super::condition::FilterCondition;
use crate::services::cdc::ProductImage;

/// Destination name → ordered conditions. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestinationRuleSet {
    destinations: BTreeMap<String, Vec<FilterCondition>>,
}

impl DestinationRuleSet {
    pub fn new(destinations: BTreeMap<String, Vec<FilterCondition>>) -> Self {
        Self { destinations }
    }

    pub fn conditions(&self, destination: &str) -> Option<&[FilterCondition]> {
        self.destinations.get(destination).map(Vec::as_slice)
    }

    pub fn destination_names(&self) -> impl Iterator<Item = &str> {
        self.destinations.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[FilterCondition])> {
        self.destinations
            .iter()
            .map(|(name, conditions)| (name.as_str(), conditions.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

/// Routes records to destinations against the active rule snapshot.
///
/// Readers clone the snapshot `Arc` and drop the lock before evaluating, so a
/// reload never waits on, or blocks, in-flight matching.
pub struct FilterEngine {
    active: RwLock<Arc<DestinationRuleSet>>,
}

impl FilterEngine {
    pub fn new(rules: DestinationRuleSet) -> Self {
        Self {
            active: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn snapshot(&self) -> Arc<DestinationRuleSet> {
        let guard = self.active.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the active rule set atomically
    pub fn reload(&self, rules: DestinationRuleSet) {
        let destinations = rules.len();
        let mut guard = self.active.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(rules);
        info!(destinations, "Filter rules reloaded");
    }

    /// True iff every condition holds. An empty condition list never matches.
    pub fn evaluate(record: &ProductImage, conditions: &[FilterCondition]) -> bool {
        !conditions.is_empty()
            && conditions
                .iter()
                .all(|condition| condition.matches(record.get(&condition.column)))
    }

    pub fn matching_destinations(&self, record: &ProductImage) -> BTreeSet<String> {
        let rules = self.snapshot();
        rules
            .iter()
            .filter(|(_, conditions)| Self::evaluate(record, conditions))
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// SQL `WHERE` fragment selecting what [`Self::matching_destinations`]
    /// would route to `destination`. Unknown or empty destinations select nothing.
    pub fn where_clause_fragment(&self, destination: &str) -> String {
        let rules = self.snapshot();
        match rules.conditions(destination) {
            Some(conditions) if !conditions.is_empty() => conditions
                .iter()
                .map(|condition| format!("({})", condition.sql_predicate()))
                .collect::<Vec<_>>()
                .join(" AND "),
            _ => "0".to_string(),
        }
    }
}
