//! Filter conditions and the operator table
//!
//! Live evaluation ([`FilterOperator::evaluate`]) and SQL push-down
//! ([`FilterOperator::sql_predicate`]) live side by side so a backfill selects
//! exactly the rows the stream would route.

use serde_json::Value;
use std::fmt;
use tracing::warn;

use crate::services::keys::key_text;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    /// Inclusive, value is `"min,max"`
    Between,
    /// Value is a comma separated list
    In,
    /// Unrecognized name from the rule source. Never matches.
    Unsupported(String),
}

impl FilterOperator {
    /// Parse an operator name; unknown names become [`FilterOperator::Unsupported`].
    pub fn parse(name: &str) -> Self {
        match name.trim().to_uppercase().as_str() {
            "EQUALS" => FilterOperator::Equals,
            "CONTAINS" => FilterOperator::Contains,
            "STARTS_WITH" => FilterOperator::StartsWith,
            "ENDS_WITH" => FilterOperator::EndsWith,
            "GREATER_THAN" => FilterOperator::GreaterThan,
            "LESS_THAN" => FilterOperator::LessThan,
            "BETWEEN" => FilterOperator::Between,
            "IN" => FilterOperator::In,
            other => FilterOperator::Unsupported(other.to_string()),
        }
    }

    /// Evaluate against a present record value. Comparison failures are `false`.
    pub fn evaluate(&self, record_value: &Value, filter_value: &str) -> bool {
        match self {
            FilterOperator::Equals => value_text(record_value) == filter_value.to_lowercase(),
            FilterOperator::Contains => value_text(record_value).contains(&filter_value.to_lowercase()),
            FilterOperator::StartsWith => {
                value_text(record_value).starts_with(&filter_value.to_lowercase())
            }
            FilterOperator::EndsWith => {
                value_text(record_value).ends_with(&filter_value.to_lowercase())
            }
            FilterOperator::GreaterThan => match (value_number(record_value), parse_number(filter_value)) {
                (Some(lhs), Some(rhs)) => lhs > rhs,
                _ => false,
            },
            FilterOperator::LessThan => match (value_number(record_value), parse_number(filter_value)) {
                (Some(lhs), Some(rhs)) => lhs < rhs,
                _ => false,
            },
            FilterOperator::Between => match (value_number(record_value), parse_range(filter_value)) {
                (Some(v), Some((min, max))) => min <= v && v <= max,
                _ => false,
            },
            FilterOperator::In => {
                let needle = value_text(record_value);
                parse_list(filter_value).iter().any(|candidate| *candidate == needle)
            }
            FilterOperator::Unsupported(name) => {
                warn!(operator = %name, "Unsupported filter operator, condition does not match");
                false
            }
        }
    }

    /// ClickHouse predicate equivalent to [`FilterOperator::evaluate`].
    ///
    /// Anything live evaluation always rejects renders as `0`.
    pub fn sql_predicate(&self, column: &str, filter_value: &str) -> String {
        let text_col = format!("lowerUTF8(toString({}))", column);
        let num_col = format!("toFloat64OrNull(toString({}))", column);
        let lowered = sql_string(&filter_value.to_lowercase());

        match self {
            FilterOperator::Equals => format!("{} = {}", text_col, lowered),
            FilterOperator::Contains => format!("position({}, {}) > 0", text_col, lowered),
            FilterOperator::StartsWith => format!("startsWith({}, {})", text_col, lowered),
            FilterOperator::EndsWith => format!("endsWith({}, {})", text_col, lowered),
            FilterOperator::GreaterThan => match parse_number(filter_value) {
                Some(rhs) => format!("{} > {}", num_col, rhs),
                None => "0".to_string(),
            },
            FilterOperator::LessThan => match parse_number(filter_value) {
                Some(rhs) => format!("{} < {}", num_col, rhs),
                None => "0".to_string(),
            },
            FilterOperator::Between => match parse_range(filter_value) {
                Some((min, max)) => format!("{} BETWEEN {} AND {}", num_col, min, max),
                None => "0".to_string(),
            },
            FilterOperator::In => {
                let items: Vec<String> = parse_list(filter_value)
                    .iter()
                    .map(|item| sql_string(item))
                    .collect();
                format!("{} IN ({})", text_col, items.join(", "))
            }
            FilterOperator::Unsupported(_) => "0".to_string(),
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterOperator::Equals => "EQUALS",
            FilterOperator::Contains => "CONTAINS",
            FilterOperator::StartsWith => "STARTS_WITH",
            FilterOperator::EndsWith => "ENDS_WITH",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::Between => "BETWEEN",
            FilterOperator::In => "IN",
            FilterOperator::Unsupported(name) => name.as_str(),
        };
        f.write_str(name)
    }
}

/// Parsed and carried, but conditions are always combined with AND.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicalOp {
    #[default]
    And,
    Or,
}

impl LogicalOp {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_uppercase().as_str() {
            "OR" => LogicalOp::Or,
            _ => LogicalOp::And,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
    pub column: String,
    pub operator: FilterOperator,
    pub value: String,
    pub logical_op: LogicalOp,
}

impl FilterCondition {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
            logical_op: LogicalOp::And,
        }
    }

    /// A missing or null column never matches.
    pub fn matches(&self, column_value: Option<&Value>) -> bool {
        match column_value {
            Some(value) if !value.is_null() => self.operator.evaluate(value, &self.value),
            _ => false,
        }
    }

    pub fn sql_predicate(&self) -> String {
        self.operator.sql_predicate(&self.column, &self.value)
    }
}

/// Lowercased text form of a record value. Numbers use the key form, so a
/// float `150000.0` reads `150000` as ClickHouse's `toString` renders it.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_lowercase(),
        Value::Number(_) => key_text(Some(value)),
        other => other.to_string().to_lowercase(),
    }
}

fn value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_range(s: &str) -> Option<(f64, f64)> {
    let mut parts = s.split(',');
    let min = parse_number(parts.next()?)?;
    let max = parse_number(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((min, max))
}

fn parse_list(s: &str) -> Vec<String> {
    s.split(',').map(|item| item.trim().to_lowercase()).collect()
}

/// Quote a string literal for ClickHouse.
///
/// `?` is written as `\x3F` since the client treats a bare `?` as a bind slot.
fn sql_string(s: &str) -> String {
    let escaped = s
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('?', "\\x3F");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operator_names() {
        assert_eq!(FilterOperator::parse(" contains "), FilterOperator::Contains);
        assert_eq!(FilterOperator::parse("GREATER_THAN"), FilterOperator::GreaterThan);
        assert_eq!(
            FilterOperator::parse("regex"),
            FilterOperator::Unsupported("REGEX".to_string())
        );
        assert_eq!(LogicalOp::parse("or"), LogicalOp::Or);
        assert_eq!(LogicalOp::parse(""), LogicalOp::And);
    }

    #[test]
    fn test_string_operators_ignore_case() {
        let brand = json!("Hapas Beauty");
        assert!(FilterOperator::Equals.evaluate(&brand, "hapas beauty"));
        assert!(FilterOperator::Contains.evaluate(&brand, "HAPAS"));
        assert!(FilterOperator::StartsWith.evaluate(&brand, "hapas"));
        assert!(FilterOperator::EndsWith.evaluate(&brand, "Beauty"));
        assert!(!FilterOperator::Equals.evaluate(&brand, "hapas"));
    }

    #[test]
    fn test_numeric_operators() {
        let price = json!(150000);
        assert!(FilterOperator::GreaterThan.evaluate(&price, "100000"));
        assert!(!FilterOperator::LessThan.evaluate(&price, "100000"));
        assert!(FilterOperator::GreaterThan.evaluate(&json!("150000.5"), "150000"));
        // Non-numeric on either side is a miss, not an error
        assert!(!FilterOperator::GreaterThan.evaluate(&json!("n/a"), "1"));
        assert!(!FilterOperator::GreaterThan.evaluate(&price, "lots"));
    }

    #[test]
    fn test_between_is_inclusive() {
        assert!(FilterOperator::Between.evaluate(&json!(10), "10,20"));
        assert!(FilterOperator::Between.evaluate(&json!(20), " 10 , 20 "));
        assert!(!FilterOperator::Between.evaluate(&json!(21), "10,20"));
        assert!(!FilterOperator::Between.evaluate(&json!(15), "10"));
        assert!(!FilterOperator::Between.evaluate(&json!(15), "10,20,30"));
    }

    #[test]
    fn test_in_list_trimmed_and_case_insensitive() {
        let category = json!("Skincare");
        assert!(FilterOperator::In.evaluate(&category, "Makeup, skincare ,Haircare"));
        assert!(!FilterOperator::In.evaluate(&category, "Makeup,Haircare"));
    }

    #[test]
    fn test_float_values_match_like_sql_push_down() {
        let price = json!(150000.0);
        assert!(FilterOperator::Equals.evaluate(&price, "150000"));
        assert!(FilterOperator::In.evaluate(&price, "150000,2"));
        assert!(FilterOperator::StartsWith.evaluate(&json!(1200.5), "1200.5"));
        assert!(!FilterOperator::Equals.evaluate(&price, "150000.0"));
        assert_eq!(
            FilterOperator::Equals.sql_predicate("price", "150000"),
            "lowerUTF8(toString(price)) = '150000'"
        );
    }

    #[test]
    fn test_missing_or_null_column_never_matches() {
        let condition = FilterCondition::new("brand", FilterOperator::Contains, "x");
        assert!(!condition.matches(None));
        assert!(!condition.matches(Some(&Value::Null)));
    }

    #[test]
    fn test_unsupported_operator_never_matches() {
        let op = FilterOperator::Unsupported("LIKE".to_string());
        assert!(!op.evaluate(&json!("anything"), "anything"));
        assert_eq!(op.sql_predicate("brand", "x"), "0");
    }

    #[test]
    fn test_sql_predicates() {
        assert_eq!(
            FilterOperator::Contains.sql_predicate("brand", "Hapas"),
            "position(lowerUTF8(toString(brand)), 'hapas') > 0"
        );
        assert_eq!(
            FilterOperator::GreaterThan.sql_predicate("price", "100000"),
            "toFloat64OrNull(toString(price)) > 100000"
        );
        assert_eq!(
            FilterOperator::Between.sql_predicate("price", "10,20.5"),
            "toFloat64OrNull(toString(price)) BETWEEN 10 AND 20.5"
        );
        assert_eq!(
            FilterOperator::In.sql_predicate("category", "Skincare, Makeup"),
            "lowerUTF8(toString(category)) IN ('skincare', 'makeup')"
        );
        assert_eq!(FilterOperator::LessThan.sql_predicate("price", "cheap"), "0");
    }

    #[test]
    fn test_sql_string_escapes_quotes() {
        assert_eq!(
            FilterOperator::Equals.sql_predicate("shop_name", "O'Neil"),
            "lowerUTF8(toString(shop_name)) = 'o\\'neil'"
        );
        assert_eq!(
            FilterOperator::Contains.sql_predicate("product_name", "why?"),
            "position(lowerUTF8(toString(product_name)), 'why\\x3F') > 0"
        );
    }
}
