//! Canonical JSON serialization.
//!
//! One serialized form per logical value: object keys in ascending byte
//! order at every level, no insignificant whitespace, standard JSON string
//! escapes, and integers only — any float literal raises
//! [`CanonicalizationError`]. The output depends solely on the value, never
//! on locale, time zone, or platform, which is what makes the journal hash
//! chain and the manifest signature reproducible anywhere.
//!
//! # Example
//!
//! ```
//! use heidi_canonical::to_canonical_string;
//!
//! let value = serde_json::json!({"b": 2, "a": {"z": 1, "y": 0}});
//! assert_eq!(
//!     to_canonical_string(&value).expect("canonical"),
//!     r#"{"a":{"y":0,"z":1},"b":2}"#
//! );
//! ```

use serde_json::Value;
use thiserror::Error;

/// Rejection reasons for non-canonical input.
#[derive(Debug, Error)]
pub enum CanonicalizationError {
    /// Float literals (including NaN/Inf once parsed) have no canonical
    /// integer form.
    #[error("non-integer number has no canonical form: {0}")]
    Float(String),

    /// The input string is not JSON at all.
    #[error("invalid json: {0}")]
    InvalidJson(String),
}

/// Serialize a value into its unique canonical form.
pub fn to_canonical_string(value: &Value) -> Result<String, CanonicalizationError> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

/// Parse a JSON document and return its canonical form.
pub fn canonicalize_str(input: &str) -> Result<String, CanonicalizationError> {
    let value: Value =
        serde_json::from_str(input).map_err(|e| CanonicalizationError::InvalidJson(e.to_string()))?;
    to_canonical_string(&value)
}

/// Whether a document is already in canonical form, byte for byte.
pub fn is_canonical(input: &str) -> bool {
    canonicalize_str(input).map(|c| c == input).unwrap_or(false)
}

fn write_value(value: &Value, out: &mut String) -> Result<(), CanonicalizationError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                return Err(CanonicalizationError::Float(n.to_string()));
            }
        }
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                // Key presence is guaranteed; avoid indexing panic paths.
                if let Some(val) = map.get(*key) {
                    write_value(val, out)?;
                }
            }
            out.push('}');
        }
    }
    Ok(())
}

// Standard JSON escaping, byte-identical to serde_json's compact form.
fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
