//! Sanitize request-context payloads to prevent prototype pollution attacks.
//!
//! The request context (path, headers) crosses the host/guest boundary as a
//! JSON object literal embedded in generated source. Header names are
//! attacker-controlled, so keys like `__proto__`, `constructor`, and
//! `prototype` are rejected before the payload reaches the sandbox.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

/// Maximum recursion depth for nested objects/arrays
const MAX_DEPTH: usize = 32;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Recursively sanitize a context payload, erroring if dangerous keys are
/// found.
///
/// # Errors
/// Returns an error if:
/// - A dangerous key (`__proto__`, `constructor`, `prototype`) is found
/// - Nesting depth exceeds MAX_DEPTH (32)
pub fn sanitize_context(value: Value) -> Result<Value> {
    sanitize_recursive(value, 0)
}

fn sanitize_recursive(value: Value, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(anyhow!(
            "request context nesting too deep (max {} levels)",
            MAX_DEPTH
        ));
    }

    match value {
        Value::Object(map) => {
            for key in map.keys() {
                if DANGEROUS_KEYS.contains(&key.as_str()) {
                    return Err(anyhow!(
                        "prototype pollution attempt: '{}' key is forbidden in the request context",
                        key
                    ));
                }
            }

            let mut sanitized = Map::new();
            for (key, val) in map {
                sanitized.insert(key, sanitize_recursive(val, depth + 1)?);
            }
            Ok(Value::Object(sanitized))
        }
        Value::Array(arr) => {
            let sanitized: Result<Vec<Value>> = arr
                .into_iter()
                .map(|v| sanitize_recursive(v, depth + 1))
                .collect();
            Ok(Value::Array(sanitized?))
        }
        // Primitives are safe
        other => Ok(other),
    }
}
