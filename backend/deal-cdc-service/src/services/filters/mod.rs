//! Destination filter rules: conditions, the matching engine and rule loading

mod condition;
mod engine;
mod source;

pub use condition::{FilterCondition, FilterOperator, LogicalOp};
pub use engine::{DestinationRuleSet, FilterEngine};
pub use source::{parse_rules, JsonFileRuleSource, RuleSource};
