//! Environment variable parsing utilities
//!
//! Every ClickHouse setting is read as `<PREFIX>_<SUFFIX>` so one process can
//! hold several independently configured clusters (warehouse and source).

use std::str::FromStr;

/// Build the full variable name for a prefixed setting
///
/// # Example
/// ```ignore
/// assert_eq!(prefixed_key("CLICKHOUSE_EDW", "URL"), "CLICKHOUSE_EDW_URL");
/// ```
pub fn prefixed_key(prefix: &str, suffix: &str) -> String {
    if prefix.is_empty() {
        suffix.to_string()
    } else {
        format!("{}_{}", prefix.trim_end_matches('_'), suffix)
    }
}

/// Parse an environment variable with a default fallback
pub fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read a string variable, falling back to `default` when unset
pub fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
