//! Dotted-path lookups into JSON responses.

use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};

/// Walk `path` (dot separated, numeric segments index arrays) through `value`.
///
/// `lookup(&v, "hits.hits.0._id")`
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Like [`lookup`] but a missing path is a malformed response.
pub fn require<'a>(value: &'a Value, path: &str) -> HarnessResult<&'a Value> {
    lookup(value, path)
        .ok_or_else(|| HarnessError::fatal(format!("response is missing field '{}'", path)))
}

pub fn require_str<'a>(value: &'a Value, path: &str) -> HarnessResult<&'a str> {
    require(value, path)?
        .as_str()
        .ok_or_else(|| HarnessError::fatal(format!("field '{}' is not a string", path)))
}

pub fn require_u64(value: &Value, path: &str) -> HarnessResult<u64> {
    let field = require(value, path)?;
    // 7.x reports totals as {"value": N, "relation": "eq"}
    field
        .as_u64()
        .or_else(|| field.get("value").and_then(Value::as_u64))
        .ok_or_else(|| HarnessError::fatal(format!("field '{}' is not a count", path)))
}

pub fn require_bool(value: &Value, path: &str) -> HarnessResult<bool> {
    require(value, path)?
        .as_bool()
        .ok_or_else(|| HarnessError::fatal(format!("field '{}' is not a boolean", path)))
}
