//! Vocabulary types shared across the engine

use std::collections::BTreeMap;

/// Scalar value carried by record attributes, matching outputs and
/// entity fields.
pub type Value = serde_json::Value;

/// Field name to value map uniquely identifying one entity.
///
/// Ordered so that identical content always renders the same key.
pub type InstanceKey = BTreeMap<String, Value>;

/// Compact `field=value` rendering of a key for log lines.
pub fn key_display(key: &InstanceKey) -> String {
    let parts: Vec<String> = key.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    parts.join(" ")
}
