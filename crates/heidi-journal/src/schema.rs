//! Strict event schema validation (schema lock).
//!
//! Both the writer and the replay verifier funnel every line through
//! [`validate_strict`]: a line is acceptable iff it parses into the 12-key
//! [`Event`] shape, every enum value is known, sizes are within budget, the
//! chain hash is well-formed hex, and no string field smuggles a bare
//! `NaN`/`Inf` token.

use heidi_types::{Event, KernelError, EVENT_VERSION, MAX_ARTIFACT_PATH_CHARS, MAX_MESSAGE_CHARS};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::chain;

static NON_FINITE_TOKEN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\b(?:NaN|Inf(?:inity)?)\b").ok());

/// True if a string field carries a bare NaN/Inf token. Case-sensitive on
/// word boundaries, so "info" and "information" pass.
pub fn contains_non_finite_token(s: &str) -> bool {
    NON_FINITE_TOKEN
        .as_ref()
        .is_some_and(|regex| regex.is_match(s))
}

fn string_fields(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| string_fields(v, out)),
        Value::Object(map) => map.values().for_each(|v| string_fields(v, out)),
        _ => {}
    }
}

/// Validate a journal line (as a JSON value) under the strict v1.0 schema
/// and return the typed event.
///
/// `run_id` pins the event to the journal it is entering; `max_round`
/// bounds the round counter when the caller knows the configured rounds.
pub fn validate_strict(
    value: &Value,
    run_id: &str,
    max_round: Option<u64>,
) -> Result<Event, KernelError> {
    let object = value
        .as_object()
        .ok_or_else(|| KernelError::SchemaLock("event is not a JSON object".to_string()))?;
    if object.len() != 12 {
        return Err(KernelError::SchemaLock(format!(
            "expected exactly 12 keys, found {}",
            object.len()
        )));
    }

    // deny_unknown_fields + no defaults: this parse refuses missing keys,
    // extra keys, unknown enum values, and float-typed integers.
    let event: Event = serde_json::from_value(value.clone())
        .map_err(|e| KernelError::SchemaLock(format!("event parse: {e}")))?;

    if event.event_version != EVENT_VERSION {
        return Err(KernelError::SchemaLock(format!(
            "event_version {:?} is not {EVENT_VERSION:?}",
            event.event_version
        )));
    }
    if !heidi_clock::is_valid_timestamp(&event.ts) {
        return Err(KernelError::SchemaLock(format!(
            "ts {:?} is not UTC millisecond ISO-8601",
            event.ts
        )));
    }
    match heidi_pathguard::sanitize_identifier(&event.run_id) {
        Ok(clean) if clean == event.run_id => {}
        _ => {
            return Err(KernelError::SchemaLock(format!(
                "run_id {:?} is not a sanitized identifier",
                event.run_id
            )));
        }
    }
    if event.run_id != run_id {
        return Err(KernelError::SchemaLock(format!(
            "run_id {:?} does not belong to journal {run_id:?}",
            event.run_id
        )));
    }
    if let Some(bound) = max_round {
        if event.round > bound {
            return Err(KernelError::SchemaLock(format!(
                "round {} exceeds configured bound {bound}",
                event.round
            )));
        }
    }
    if event.message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(KernelError::SchemaLock(format!(
            "message exceeds {MAX_MESSAGE_CHARS} chars"
        )));
    }
    for path in &event.artifact_paths {
        if path.chars().count() > MAX_ARTIFACT_PATH_CHARS {
            return Err(KernelError::SchemaLock(format!(
                "artifact path exceeds {MAX_ARTIFACT_PATH_CHARS} chars: {path:?}"
            )));
        }
    }
    if !chain::is_hash_hex(&event.prev_hash) {
        return Err(KernelError::SchemaLock(
            "prev_hash is not 64 lowercase hex chars".to_string(),
        ));
    }

    let mut strings = Vec::new();
    string_fields(value, &mut strings);
    for s in &strings {
        if contains_non_finite_token(s) {
            return Err(KernelError::SchemaLock(format!(
                "string field carries a non-finite token: {s:?}"
            )));
        }
    }

    Ok(event)
}
