use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::condition::{FilterCondition, FilterOperator, LogicalOp};
use super::engine::DestinationRuleSet;
use crate::error::{PipelineError, Result};

/// Supplies rule set snapshots
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn load(&self) -> Result<DestinationRuleSet>;
}

/// One row of a destination's rule sheet
#[derive(Debug, Deserialize)]
struct RuleRow {
    #[serde(default)]
    column_name: Option<String>,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    logical_operator: Option<String>,
}

/// Reads `{ "<destination>": [ {column_name, operator, value, logical_operator}, ... ] }`
pub struct JsonFileRuleSource {
    path: PathBuf,
}

impl JsonFileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuleSource for JsonFileRuleSource {
    async fn load(&self) -> Result<DestinationRuleSet> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            PipelineError::Configuration(format!(
                "cannot read filter rules from {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let rules = parse_rules(&raw)?;
        info!(
            path = %self.path.display(),
            destinations = rules.len(),
            "Loaded filter rules"
        );
        Ok(rules)
    }
}

/// Parse and validate a JSON rule document
pub fn parse_rules(raw: &str) -> Result<DestinationRuleSet> {
    let sheets: BTreeMap<String, Vec<RuleRow>> = serde_json::from_str(raw)
        .map_err(|e| PipelineError::Configuration(format!("unparseable filter rules: {}", e)))?;

    let mut destinations = BTreeMap::new();
    for (destination, rows) in sheets {
        let destination = destination.trim().to_string();
        let mut conditions = Vec::with_capacity(rows.len());

        for row in rows {
            let (Some(column), Some(operator)) = (
                row.column_name.as_deref().map(str::trim).filter(|c| !c.is_empty()),
                row.operator.as_deref().map(str::trim).filter(|o| !o.is_empty()),
            ) else {
                debug!(destination = %destination, "Skipping rule row without column or operator");
                continue;
            };

            if !is_identifier(column) {
                return Err(PipelineError::Configuration(format!(
                    "destination '{}': invalid column name '{}'",
                    destination, column
                )));
            }

            let operator = FilterOperator::parse(operator);
            if let FilterOperator::Unsupported(name) = &operator {
                warn!(destination = %destination, operator = %name, "Unknown filter operator, condition will never match");
            }

            let logical_op = row
                .logical_operator
                .as_deref()
                .map(LogicalOp::parse)
                .unwrap_or_default();
            if logical_op == LogicalOp::Or {
                warn!(destination = %destination, column = %column, "OR is not supported, condition is combined with AND");
            }

            conditions.push(FilterCondition {
                column: column.to_string(),
                operator,
                value: rule_value(row.value.as_ref()),
                logical_op,
            });
        }

        if conditions.is_empty() {
            warn!(destination = %destination, "Destination has no usable conditions, dropped");
            continue;
        }
        destinations.insert(destination, conditions);
    }

    if destinations.is_empty() {
        return Err(PipelineError::Configuration(
            "filter rule set is empty".to_string(),
        ));
    }
    Ok(DestinationRuleSet::new(destinations))
}

fn rule_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

/// `[A-Za-z_][A-Za-z0-9_.]*`
fn is_identifier(column: &str) -> bool {
    let mut chars = column.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
