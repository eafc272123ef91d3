//! Replay verification.
//!
//! Replay re-walks a journal with no state from the writer: it re-parses
//! every line, requires canonical-form byte identity, recomputes the hash
//! chain from SHA-256(run_id), re-applies the strict schema, checks
//! monotonic timestamps, and — when a manifest sits next to the journal —
//! re-canonicalizes it and verifies the HMAC signature. Used offline by
//! operators and as a CI gate; any refusal maps to a non-zero exit in the
//! CLI.
//!
//! Replay is bit-deterministic: the final chain digest depends only on the
//! journal bytes, never on locale, time zone, or how many times it runs.

use std::fs;
use std::path::Path;

use heidi_gate::SigningKey;
use heidi_journal::{chain, schema};
use heidi_types::{KernelError, Manifest, MAX_EVENT_BYTES};

/// Outcome of a successful replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub run_id: String,
    pub event_count: u64,
    /// Chain head after the last line (the seed hash for an empty journal).
    pub final_hash: String,
    /// The verified manifest, when one was present next to the journal.
    pub manifest: Option<Manifest>,
}

/// Re-walk a journal and recompute everything the writer claimed.
///
/// `run_id` may be omitted, in which case it is taken from the first line
/// (and the seed check still binds it to the chain). `key` is required to
/// verify a manifest; a manifest that is present but unverifiable —
/// including "no key supplied" — refuses, fail-closed.
pub fn replay_journal(
    journal_path: &Path,
    run_id: Option<&str>,
    key: Option<&SigningKey>,
) -> Result<ReplayReport, KernelError> {
    let content = fs::read_to_string(journal_path)?;
    let mut lines = Vec::new();
    for line in content.split_inclusive('\n') {
        lines.push(line);
    }

    let mut resolved_run_id = run_id.map(str::to_string);
    let mut expected_prev: Option<String> = resolved_run_id.as_deref().map(chain::seed_hash);
    let mut last_ts = String::new();
    let mut event_count: u64 = 0;

    for (idx, framed) in lines.iter().enumerate() {
        let line_no = idx + 1;
        let Some(line) = framed.strip_suffix('\n') else {
            return Err(KernelError::ChainBreak {
                line: line_no,
                detail: "journal ends without a newline".to_string(),
            });
        };

        if framed.len() > MAX_EVENT_BYTES {
            return Err(KernelError::SchemaLock(format!(
                "line {line_no} is {} bytes, over the 1 MiB frame limit",
                framed.len()
            )));
        }

        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            KernelError::ChainBreak {
                line: line_no,
                detail: format!("line is not JSON: {e}"),
            }
        })?;

        // The writer frames canonical bytes; anything else was edited
        // after the fact.
        let canonical = heidi_canonical::to_canonical_string(&value)
            .map_err(|e| KernelError::Canonicalization(e.to_string()))?;
        if canonical != line {
            return Err(KernelError::ChainBreak {
                line: line_no,
                detail: "line is not in canonical form".to_string(),
            });
        }

        // First line pins the run id when the caller did not supply one.
        if resolved_run_id.is_none() {
            let from_line = value
                .get("run_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            expected_prev = Some(chain::seed_hash(&from_line));
            resolved_run_id = Some(from_line);
        }
        let bound_run_id = resolved_run_id.as_deref().unwrap_or_default();
        let event = schema::validate_strict(&value, bound_run_id, None)?;

        let expected = expected_prev.as_deref().unwrap_or_default();
        if event.prev_hash != expected {
            return Err(KernelError::ChainBreak {
                line: line_no,
                detail: format!(
                    "prev_hash {} does not match recomputed {}",
                    &event.prev_hash[..12.min(event.prev_hash.len())],
                    &expected[..12.min(expected.len())]
                ),
            });
        }

        if event.ts.as_str() < last_ts.as_str() {
            return Err(KernelError::SchemaLock(format!(
                "ts went backwards at line {line_no}: {} after {}",
                event.ts, last_ts
            )));
        }
        last_ts = event.ts;

        expected_prev = Some(chain::line_hash(framed.as_bytes()));
        event_count += 1;
    }

    let final_run_id = resolved_run_id.unwrap_or_default();
    let final_hash = expected_prev.unwrap_or_else(|| chain::seed_hash(&final_run_id));

    let manifest = verify_sibling_manifest(journal_path, key)?;

    Ok(ReplayReport {
        run_id: final_run_id,
        event_count,
        final_hash,
        manifest,
    })
}

// A manifest next to the journal must verify or the replay refuses; a
// missing manifest is simply "nothing was promoted".
fn verify_sibling_manifest(
    journal_path: &Path,
    key: Option<&SigningKey>,
) -> Result<Option<Manifest>, KernelError> {
    let Some(run_root) = journal_path.parent() else {
        return Ok(None);
    };
    let manifest_file = heidi_gate::manifest_path(run_root);
    if !manifest_file.exists() {
        return Ok(None);
    }

    let Some(key) = key else {
        return Err(KernelError::SignatureInvalid(
            "manifest present but no verification key supplied".to_string(),
        ));
    };

    let manifest_json = fs::read_to_string(&manifest_file)?;
    let signature = fs::read_to_string(heidi_gate::manifest_sig_path(run_root)).map_err(|e| {
        KernelError::SignatureInvalid(format!("signature unreadable: {e}"))
    })?;
    heidi_gate::signer::verify_manifest(&manifest_json, &signature, key).map(Some)
}
