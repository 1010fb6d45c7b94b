//! Entry shape history.
//!
//! | version | change                                                     |
//! |---------|------------------------------------------------------------|
//! | 1       | `fetched_at` (Unix seconds), `range`, optional `source`    |
//! | 2       | `fetched_at` becomes RFC 3339 `last_refresh`               |
//! | 3       | `range` renamed `coverage`; `source` folded into `provenance` |
//!
//! Each step is a pure function from one shape to the next.

use chrono::{DateTime, SecondsFormat};
use serde_json::{json, Map, Value};

/// Rewrites one entry document from version `v` to `v + 1`.
pub type MigrationStep = fn(Value) -> Result<Value, String>;

/// Provider recorded for entries written before provenance existed.
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// The ordered chain; element `i` migrates version `i + 1`.
pub fn default_chain() -> Vec<MigrationStep> {
    vec![v1_to_v2, v2_to_v3]
}

fn object(entry: Value) -> Result<Map<String, Value>, String> {
    match entry {
        Value::Object(map) => Ok(map),
        other => Err(format!("entry is not an object: {}", other)),
    }
}

/// Unix-seconds `fetched_at` becomes an RFC 3339 `last_refresh`.
pub fn v1_to_v2(entry: Value) -> Result<Value, String> {
    let mut map = object(entry)?;
    let secs = map
        .remove("fetched_at")
        .and_then(|v| v.as_i64())
        .ok_or("missing integer fetched_at")?;
    let instant = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| format!("fetched_at {} out of range", secs))?;
    map.insert(
        "last_refresh".to_string(),
        Value::String(instant.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    Ok(Value::Object(map))
}

/// `range` becomes `coverage`; `source` moves into a provenance record.
pub fn v2_to_v3(entry: Value) -> Result<Value, String> {
    let mut map = object(entry)?;
    if !map.contains_key("last_refresh") {
        return Err("missing last_refresh".to_string());
    }
    let coverage = map.remove("range").unwrap_or(Value::Null);
    map.insert("coverage".to_string(), coverage);

    let provider = match map.remove("source") {
        Some(Value::String(source)) if !source.is_empty() => source,
        _ => UNKNOWN_PROVIDER.to_string(),
    };
    map.insert(
        "provenance".to_string(),
        json!({ "provider": provider, "fetches": 1 }),
    );
    Ok(Value::Object(map))
}
