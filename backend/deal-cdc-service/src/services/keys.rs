//! Surrogate key derivation
//!
//! Every key is the first 15 hex digits of the MD5 digest of its input, read
//! as an unsigned integer (60 significant bits). The translator and the writer
//! both call [`SurrogateKeys::derive`]; there is no second implementation.

use serde_json::Value;

/// Hash a key input to a stable 60-bit integer
pub fn surrogate_key(input: &str) -> u64 {
    let digest = md5::compute(input.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.0[..8]);
    // 16 hex digits in 8 bytes, drop the last nibble
    u64::from_be_bytes(head) >> 4
}

/// Canonical text of a key component.
///
/// Numbers are rendered through `f64`/`i64` so `150000`, `150000.0` and
/// `"150000"` all produce the same key.
pub fn key_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.as_f64().map(|f| f.to_string()).unwrap_or_default(),
        },
        Some(other) => other.to_string(),
    }
}

/// Canonical text of a numeric key component, tolerant of numeric strings
pub fn numeric_key_text(value: Option<&Value>) -> String {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(f) => f.to_string(),
        None => key_text(value),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurrogateKeys {
    pub product_key: u64,
    pub destination_key: u64,
    pub product_destination_key: u64,
    /// Attribute-version hash used for slowly-changing comparison
    pub product_change_fingerprint: u64,
}

impl SurrogateKeys {
    pub fn derive(
        product_id: &str,
        destination: &str,
        product_name: &str,
        price: &str,
        revenue: &str,
    ) -> Self {
        Self {
            product_key: surrogate_key(product_id),
            destination_key: surrogate_key(destination),
            product_destination_key: surrogate_key(&format!("{}||{}", product_id, destination)),
            product_change_fingerprint: surrogate_key(&format!(
                "{}||{}||{}",
                product_name, price, revenue
            )),
        }
    }
}
